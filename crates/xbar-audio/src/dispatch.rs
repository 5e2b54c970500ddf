//! Command dispatch by module instance name.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use xbar_core::{Error, Result};
use xbar_plugin::{CommandHandler, Properties};

/// Routes property-set commands to the handler registered for an instance
#[derive(Default)]
pub struct CmdDispatcher {
    handlers: RwLock<HashMap<String, Arc<dyn CommandHandler>>>,
}

impl CmdDispatcher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails if the instance name is already taken
    pub fn register(&self, instance: &str, handler: Arc<dyn CommandHandler>) -> Result<()> {
        let mut handlers = self.handlers.write();
        if handlers.contains_key(instance) {
            return Err(Error::Failed(format!(
                "a command handler is already registered for '{instance}'"
            )));
        }
        handlers.insert(instance.to_string(), handler);
        tracing::debug!("Registered command handler for '{}'", instance);
        Ok(())
    }

    pub fn unregister(&self, instance: &str) -> Result<()> {
        self.handlers
            .write()
            .remove(instance)
            .map(|_| ())
            .ok_or_else(|| Error::ObjectNotFound(format!("no command handler for '{instance}'")))
    }

    #[must_use]
    pub fn is_registered(&self, instance: &str) -> bool {
        self.handlers.read().contains_key(instance)
    }

    /// Registered instance names, sorted
    #[must_use]
    pub fn instances(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Forward `cmd` to the instance's handler; its answer lands in `response`
    pub fn dispatch_cmd(&self, instance: &str, cmd: &Properties, response: &mut Properties) -> Result<()> {
        // Release the lock before the handler runs
        let handler = self
            .handlers
            .read()
            .get(instance)
            .cloned()
            .ok_or_else(|| Error::ObjectNotFound(format!("no command handler for '{instance}'")))?;

        handler.process_cmd(cmd, response).inspect_err(|e| {
            tracing::warn!("Command for '{}' failed: {}", instance, e);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use xbar_plugin::{CMD_KEY, command_id};

    /// Answers cmd 0 with the count of calls so far, rejects cmd 1
    #[derive(Default)]
    struct Counter {
        calls: Mutex<i32>,
    }

    impl CommandHandler for Counter {
        fn process_cmd(&self, cmd: &Properties, response: &mut Properties) -> Result<()> {
            match command_id(cmd, 2)? {
                0 => {
                    let mut calls = self.calls.lock();
                    *calls += 1;
                    response.set("calls", *calls);
                    Ok(())
                }
                _ => Err(Error::Failed("rejected".to_string())),
            }
        }
    }

    #[test]
    fn test_dispatch_to_registered_instance() {
        let dispatcher = CmdDispatcher::new();
        dispatcher.register("counter", Arc::new(Counter::default())).unwrap();

        let mut response = Properties::new();
        let cmd = Properties::new().with(CMD_KEY, 0);
        dispatcher.dispatch_cmd("counter", &cmd, &mut response).unwrap();
        dispatcher.dispatch_cmd("counter", &cmd, &mut response).unwrap();
        assert_eq!(response.get::<i32>("calls"), Ok(2));
    }

    #[test]
    fn test_unknown_instance() {
        let dispatcher = CmdDispatcher::new();
        let mut response = Properties::new();
        assert!(matches!(
            dispatcher.dispatch_cmd("ghost", &Properties::new().with(CMD_KEY, 0), &mut response),
            Err(Error::ObjectNotFound(_))
        ));
    }

    #[test]
    fn test_missing_or_out_of_range_cmd() {
        let dispatcher = CmdDispatcher::new();
        dispatcher.register("counter", Arc::new(Counter::default())).unwrap();
        let mut response = Properties::new();

        assert!(matches!(
            dispatcher.dispatch_cmd("counter", &Properties::new(), &mut response),
            Err(Error::InvalidParam(_))
        ));
        assert!(matches!(
            dispatcher.dispatch_cmd("counter", &Properties::new().with(CMD_KEY, 2), &mut response),
            Err(Error::InvalidParam(_))
        ));
        assert!(matches!(
            dispatcher.dispatch_cmd("counter", &Properties::new().with(CMD_KEY, 1), &mut response),
            Err(Error::Failed(_))
        ));
    }

    #[test]
    fn test_register_twice_and_unregister() {
        let dispatcher = CmdDispatcher::new();
        dispatcher.register("a", Arc::new(Counter::default())).unwrap();
        assert!(matches!(
            dispatcher.register("a", Arc::new(Counter::default())),
            Err(Error::Failed(_))
        ));
        dispatcher.register("b", Arc::new(Counter::default())).unwrap();
        assert_eq!(dispatcher.instances(), vec!["a", "b"]);

        dispatcher.unregister("a").unwrap();
        assert!(!dispatcher.is_registered("a"));
        assert!(matches!(
            dispatcher.unregister("a"),
            Err(Error::ObjectNotFound(_))
        ));
    }
}
