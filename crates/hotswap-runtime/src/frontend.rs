//! Redefinition front-end
//!
//! Entry point for class definition and redefinition callbacks. An event
//! is relevant only when a registered [`Interest`] matches the type's
//! binary name within the event's class-loader context; anything else
//! returns `None` (keep the original bytes) with no side effects.
//!
//! Relevant redefinitions become changed-type entries in the ledger of
//! every coordinator for that class-loader context, dispatched parents
//! first. Fresh definitions are handed to each container's scanner to
//! discover new managed objects.

use parking_lot::RwLock;
use regex::Regex;
use std::fmt;
use std::sync::{Arc, Weak};
use thiserror::Error;
use tracing::{debug, trace, warn};

use hotswap_kernel::config::InterestConfig;
use hotswap_kernel::{LoaderId, TypeName};

use crate::commands::{ScanCommand, schedule_reload};
use crate::registry::CoordinatorRegistry;
use crate::scheduler::CommandScheduler;

/// Failure inside a [`ClassTransformer`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TransformError {
    #[error("Malformed class file for {type_name}: {reason}")]
    Malformed { type_name: TypeName, reason: String },

    #[error("Transformer rejected {0}")]
    Rejected(TypeName),
}

/// What a transformer knows about the event.
#[derive(Debug, Clone, Copy)]
pub struct TransformContext<'a> {
    pub loader: &'a LoaderId,
    pub type_name: &'a TypeName,
    /// False for a first definition
    pub redefining: bool,
}

/// Supplies substitute bytecode for matching types.
pub trait ClassTransformer: Send + Sync {
    fn name(&self) -> &str;

    /// `Ok(None)` keeps the input bytes.
    fn transform(
        &self,
        cx: &TransformContext<'_>,
        bytecode: &[u8],
    ) -> Result<Option<Vec<u8>>, TransformError>;
}

/// Interest predicate: binary-name regex, optionally scoped to one
/// class-loader context, optionally carrying a transformer.
#[derive(Clone)]
pub struct Interest {
    pattern: Regex,
    loader: Option<LoaderId>,
    transformer: Option<Arc<dyn ClassTransformer>>,
}

impl fmt::Debug for Interest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interest")
            .field("pattern", &self.pattern.as_str())
            .field("loader", &self.loader)
            .field("transformer", &self.transformer.as_ref().map(|t| t.name()))
            .finish()
    }
}

impl Interest {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
            loader: None,
            transformer: None,
        })
    }

    pub fn from_config(config: &InterestConfig) -> Result<Self, regex::Error> {
        let interest = Self::new(&config.pattern)?;
        Ok(match &config.loader {
            Some(loader) => interest.scoped_to(loader.clone()),
            None => interest,
        })
    }

    pub fn scoped_to(mut self, loader: LoaderId) -> Self {
        self.loader = Some(loader);
        self
    }

    pub fn with_transformer(mut self, transformer: Arc<dyn ClassTransformer>) -> Self {
        self.transformer = Some(transformer);
        self
    }

    pub fn matches(&self, loader: &LoaderId, type_name: &TypeName) -> bool {
        self.loader.as_ref().is_none_or(|scope| scope == loader)
            && self.pattern.is_match(type_name.as_str())
    }
}

/// Classifies definition events and forwards relevant ones.
pub struct RedefinitionFrontEnd {
    interests: RwLock<Vec<Interest>>,
    registry: Arc<CoordinatorRegistry>,
    scheduler: Weak<CommandScheduler>,
}

impl RedefinitionFrontEnd {
    pub fn new(registry: Arc<CoordinatorRegistry>, scheduler: &Arc<CommandScheduler>) -> Self {
        Self {
            interests: RwLock::new(Vec::new()),
            registry,
            scheduler: Arc::downgrade(scheduler),
        }
    }

    pub fn register_interest(&self, interest: Interest) {
        debug!(?interest, "Registered interest");
        self.interests.write().push(interest);
    }

    pub fn interest_count(&self) -> usize {
        self.interests.read().len()
    }

    pub fn is_relevant(&self, loader: &LoaderId, type_name: &TypeName) -> bool {
        self.interests
            .read()
            .iter()
            .any(|interest| interest.matches(loader, type_name))
    }

    /// Class-file transformation callback.
    ///
    /// `type_name` may use `/` or `.` separators. Returns substitute
    /// bytes, or `None` to keep the original. Never blocks on a reload.
    pub fn transform(
        &self,
        loader: &LoaderId,
        type_name: &str,
        redefining: bool,
        bytecode: &[u8],
    ) -> Option<Vec<u8>> {
        let type_name = TypeName::new(type_name.replace('/', "."));
        let matching: Vec<Interest> = self
            .interests
            .read()
            .iter()
            .filter(|interest| interest.matches(loader, &type_name))
            .cloned()
            .collect();
        if matching.is_empty() {
            return None;
        }

        let cx = TransformContext {
            loader,
            type_name: &type_name,
            redefining,
        };
        let mut substituted: Option<Vec<u8>> = None;
        for transformer in matching.iter().filter_map(|i| i.transformer.as_ref()) {
            let input = substituted.as_deref().unwrap_or(bytecode);
            match transformer.transform(&cx, input) {
                Ok(Some(output)) => {
                    trace!(type_name = %type_name, transformer = transformer.name(), "Bytes substituted");
                    substituted = Some(output);
                }
                Ok(None) => {}
                Err(e) => warn!(
                    type_name = %type_name,
                    transformer = transformer.name(),
                    "Transformer failed, keeping bytes: {}", e
                ),
            }
        }

        let effective = substituted.as_deref().unwrap_or(bytecode);
        self.dispatch(loader, &type_name, redefining, effective);
        substituted
    }

    /// Forward to every coordinator in `loader`'s context, parents
    /// first. Returns the number of coordinators notified.
    fn dispatch(
        &self,
        loader: &LoaderId,
        type_name: &TypeName,
        redefining: bool,
        bytecode: &[u8],
    ) -> usize {
        let Some(scheduler) = self.scheduler.upgrade() else {
            debug!(type_name = %type_name, "Scheduler gone, not dispatching");
            return 0;
        };

        let coordinators = self.registry.for_loader(loader);
        for coordinator in &coordinators {
            if redefining {
                coordinator.add_changed_type(type_name.clone());
                schedule_reload(&scheduler, &self.registry, coordinator);
            } else {
                scheduler.submit(Arc::new(ScanCommand::new(
                    coordinator,
                    type_name.clone(),
                    bytecode.to_vec(),
                    &self.registry,
                    &scheduler,
                )));
            }
        }
        debug!(
            type_name = %type_name,
            loader = %loader,
            redefining,
            containers = coordinators.len(),
            "Dispatched class change"
        );
        coordinators.len()
    }
}
