// Logging utilities for the CredVault system
//
// This module provides a structured logging layer with:
// - Component-based categorization
// - Container ID tracking through logger inheritance
// - Cheap child-logger creation for sub-components

use log::{debug, error, info, warn};

/// Predefined components for logging categorization
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Component {
    Service,
    Certificate,
    Cipher,
    Pkcs7,
    Store,
    Profile,
    Policy,
    Custom(&'static str),
}

impl Component {
    /// Get the string representation of the component
    pub fn as_str(&self) -> &str {
        match self {
            Component::Service => "Service",
            Component::Certificate => "Cert",
            Component::Cipher => "Cipher",
            Component::Pkcs7 => "PKCS7",
            Component::Store => "Store",
            Component::Profile => "Profile",
            Component::Policy => "Policy",
            Component::Custom(name) => name,
        }
    }
}

/// A helper for creating component-specific loggers with container ID tracking.
///
/// The container ID identifies the secure-store instance that owns the
/// operation, so log lines from different service instances in one process
/// can be told apart.
#[derive(Debug, Clone)]
pub struct Logger {
    /// Component this logger is for
    component: Component,
    /// Container ID of the owning service instance
    container_id: String,
    /// Parent component for hierarchical logging (if any)
    parent_component: Option<Component>,
}

impl Logger {
    /// Create a new root logger for a specific component and container ID.
    /// This should only be called by the service root component.
    pub fn new_root(component: Component, container_id: &str) -> Self {
        Self {
            component,
            container_id: container_id.to_string(),
            parent_component: None,
        }
    }

    /// Create a child logger with the same container ID but different component.
    /// This is the preferred way to create loggers in sub-components.
    pub fn with_component(&self, component: Component) -> Self {
        Self {
            component,
            container_id: self.container_id.clone(),
            parent_component: Some(self.component),
        }
    }

    /// Get a reference to the container ID
    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    /// Get the component prefix for logging, including parent if available
    fn component_prefix(&self) -> String {
        match self.parent_component {
            Some(parent) if parent != Component::Service => {
                format!("{}.{}", parent.as_str(), self.component.as_str())
            }
            _ => self.component.as_str().to_string(),
        }
    }

    /// Log a debug message
    pub fn debug(&self, message: impl Into<String>) {
        if log::log_enabled!(log::Level::Debug) {
            debug!(
                "[{}][{}] {}",
                self.container_id,
                self.component_prefix(),
                message.into()
            );
        }
    }

    /// Log an info message
    pub fn info(&self, message: impl Into<String>) {
        if log::log_enabled!(log::Level::Info) {
            info!(
                "[{}][{}] {}",
                self.container_id,
                self.component_prefix(),
                message.into()
            );
        }
    }

    /// Log a warning message
    pub fn warn(&self, message: impl Into<String>) {
        if log::log_enabled!(log::Level::Warn) {
            warn!(
                "[{}][{}] {}",
                self.container_id,
                self.component_prefix(),
                message.into()
            );
        }
    }

    /// Log an error message
    pub fn error(&self, message: impl Into<String>) {
        if log::log_enabled!(log::Level::Error) {
            error!(
                "[{}][{}] {}",
                self.container_id,
                self.component_prefix(),
                message.into()
            );
        }
    }
}

/// Initialize `env_logger` output for binaries and tests.
///
/// Safe to call more than once; subsequent calls are ignored.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(false).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn component_prefix_includes_parent() {
        let root = Logger::new_root(Component::Service, "store-1");
        let child = root.with_component(Component::Store);
        assert_eq!(child.component_prefix(), "Store");

        let grandchild = child.with_component(Component::Cipher);
        assert_eq!(grandchild.component_prefix(), "Store.Cipher");
    }

    #[test]
    fn container_id_is_inherited() {
        let root = Logger::new_root(Component::Service, "store-9");
        let child = root.with_component(Component::Policy);
        assert_eq!(child.container_id(), "store-9");
    }
}
