//! Module factories and the registry that owns them.
//!
//! A [`Module`] is the pair a factory produces: the audio-side
//! [`GenericAudioComponent`] that goes into a chain, and the control-side
//! [`ModuleHandle`] that goes into the command dispatcher. The two halves
//! are separated right after creation and live on different threads.

use std::collections::HashMap;
use std::sync::Arc;

use xbar_comms::{EventReceiver, ModuleEvent};
use xbar_core::{Error, Result};
use xbar_plugin::{CommandHandler, ModuleConfig};

use crate::builtin;
use crate::component::{ComponentControl, GenericAudioComponent};

/// Creates modules of one registered type
pub trait ModuleFactory: Send + Sync {
    /// Name the type is registered under
    fn type_name(&self) -> &str;

    /// Build a module instance from its configuration
    fn create(&self, config: &ModuleConfig, instance: &str) -> Result<Module>;

    /// Release a module created by this factory
    fn destroy(&self, module: Module) {
        drop(module);
    }
}

/// Control-thread half of a module
pub struct ModuleHandle {
    instance: Arc<str>,
    type_name: Arc<str>,
    commands: Arc<dyn CommandHandler>,
    control: Arc<ComponentControl>,
    events: EventReceiver<ModuleEvent>,
}

impl ModuleHandle {
    pub fn new(
        type_name: &str,
        commands: Arc<dyn CommandHandler>,
        control: Arc<ComponentControl>,
        events: EventReceiver<ModuleEvent>,
    ) -> Self {
        Self {
            instance: Arc::clone(control.name()),
            type_name: Arc::from(type_name),
            commands,
            control,
            events,
        }
    }

    #[must_use]
    pub fn instance(&self) -> &Arc<str> {
        &self.instance
    }

    #[must_use]
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    #[must_use]
    pub fn command_handler(&self) -> Arc<dyn CommandHandler> {
        Arc::clone(&self.commands)
    }

    #[must_use]
    pub fn control(&self) -> &Arc<ComponentControl> {
        &self.control
    }

    /// Drain component events (probes) followed by module events (gains)
    pub fn events(&self) -> Vec<ModuleEvent> {
        let mut events = self.control.events();
        events.extend(self.events.drain());
        events
    }
}

impl std::fmt::Debug for ModuleHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleHandle")
            .field("instance", &self.instance)
            .field("type_name", &self.type_name)
            .finish_non_exhaustive()
    }
}

/// A freshly created module, not yet split between threads
pub struct Module {
    component: GenericAudioComponent,
    handle: ModuleHandle,
}

impl Module {
    #[must_use]
    pub fn new(component: GenericAudioComponent, handle: ModuleHandle) -> Self {
        Self { component, handle }
    }

    #[must_use]
    pub fn instance(&self) -> &Arc<str> {
        self.handle.instance()
    }

    #[must_use]
    pub fn type_name(&self) -> &str {
        self.handle.type_name()
    }

    #[must_use]
    pub fn handle(&self) -> &ModuleHandle {
        &self.handle
    }

    /// Separate the audio half from the control half
    #[must_use]
    pub fn into_parts(self) -> (GenericAudioComponent, ModuleHandle) {
        (self.component, self.handle)
    }
}

/// Factories by type name
///
/// Built explicitly by the process root and passed to whatever creates
/// modules; there is no global instance.
#[derive(Default)]
pub struct ModuleRegistry {
    factories: HashMap<String, Arc<dyn ModuleFactory>>,
}

impl ModuleRegistry {
    /// Empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every built-in module type
    ///
    /// # Panics
    ///
    /// Panics if two built-in factories share a type name.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for factory in builtin::factories() {
            registry
                .register(factory)
                .expect("built-in module names are distinct");
        }
        registry
    }

    /// Add a factory; fails if its type name is taken
    pub fn register(&mut self, factory: Arc<dyn ModuleFactory>) -> Result<()> {
        let name = factory.type_name().to_string();
        if self.factories.contains_key(&name) {
            return Err(Error::Failed(format!(
                "module type '{name}' is already registered"
            )));
        }
        tracing::debug!("Registered module type '{}'", name);
        self.factories.insert(name, factory);
        Ok(())
    }

    pub fn unregister(&mut self, type_name: &str) -> Result<()> {
        self.factories
            .remove(type_name)
            .map(|_| ())
            .ok_or_else(|| Error::ObjectNotFound(format!("module type '{type_name}'")))
    }

    #[must_use]
    pub fn contains(&self, type_name: &str) -> bool {
        self.factories.contains_key(type_name)
    }

    /// Registered type names, sorted
    #[must_use]
    pub fn types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.factories.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn create(&self, type_name: &str, config: &ModuleConfig, instance: &str) -> Result<Module> {
        let factory = self
            .factories
            .get(type_name)
            .ok_or_else(|| Error::ObjectNotFound(format!("module type '{type_name}'")))?;
        let module = factory.create(config, instance)?;
        tracing::info!("Created module '{}' of type '{}'", instance, type_name);
        Ok(module)
    }

    /// Hand a module back to the factory that made it
    pub fn destroy(&self, module: Module) -> Result<()> {
        let factory = self
            .factories
            .get(module.type_name())
            .ok_or_else(|| Error::ObjectNotFound(format!("module type '{}'", module.type_name())))?;
        tracing::info!("Destroying module '{}'", module.instance());
        factory.destroy(module);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::{mixer, volume};
    use xbar_plugin::Properties;

    fn volume_config() -> ModuleConfig {
        ModuleConfig::new(Properties::new())
            .with_stream(1, "main", 2)
            .with_in_place(1)
    }

    #[test]
    fn test_builtins_registered() {
        let registry = ModuleRegistry::with_builtins();
        assert_eq!(
            registry.types(),
            vec![mixer::TYPE_NAME.to_string(), volume::TYPE_NAME.to_string()]
        );
    }

    #[test]
    fn test_builtin_type_names_are_distinct() {
        let mut names: Vec<String> = builtin::factories()
            .iter()
            .map(|f| f.type_name().to_string())
            .collect();
        let count = names.len();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), count);
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut registry = ModuleRegistry::with_builtins();
        assert!(matches!(
            registry.register(Arc::new(volume::SimpleVolumeFactory)),
            Err(Error::Failed(_))
        ));
        registry.unregister(volume::TYPE_NAME).unwrap();
        assert!(!registry.contains(volume::TYPE_NAME));
        registry.register(Arc::new(volume::SimpleVolumeFactory)).unwrap();
    }

    #[test]
    fn test_create_and_destroy() {
        let registry = ModuleRegistry::with_builtins();
        let module = registry
            .create(volume::TYPE_NAME, &volume_config(), "vol0")
            .unwrap();
        assert_eq!(&**module.instance(), "vol0");
        assert_eq!(module.type_name(), volume::TYPE_NAME);
        assert_eq!(module.handle().control().name().as_ref(), "vol0");
        registry.destroy(module).unwrap();
    }

    #[test]
    fn test_unknown_type() {
        let registry = ModuleRegistry::new();
        assert!(matches!(
            registry.create("equalizer", &volume_config(), "eq"),
            Err(Error::ObjectNotFound(_))
        ));
    }

    #[test]
    fn test_invalid_config_rejected_at_create() {
        let registry = ModuleRegistry::with_builtins();
        // Mapping references an undeclared stream
        let config = volume_config().with_mapping(1, 9);
        assert!(registry.create(mixer::TYPE_NAME, &config, "mix").is_err());
    }
}
