//! Handler chain engine.
//!
//! Handlers are grouped into named phases; phases run in configured order and
//! handlers within a phase in declaration order, which together give every
//! handler a global index. A message runs through the chain once:
//!
//! ```text
//! Pending -> Running(0) -> Running(1) -> ... -> Completed
//!                 \-> Faulted(i) -> RolledBack
//! ```
//!
//! When handler `i` faults, `on_fault` runs on handlers `i, i-1, ..., 0`.
//! A failing `on_fault` is logged and collected; it never stops the rollback
//! and never replaces the original fault.

use crate::config::EngineConfig;
use crate::context::{ChainState, MessageContext};
use crate::error::{ChainFault, ConfigurationError, HandlerFault, SecondaryFault};
use crate::handler::{Handler, HandlerDescription};
use crate::handlers::HandlerRegistry;
use std::collections::HashSet;
use tracing::{debug, info, warn};

/// A named, ordered group of handlers.
pub struct Phase {
    name: String,
    handlers: Vec<Box<dyn Handler>>,
}

impl Phase {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// An ordered pipeline of handlers.
pub struct HandlerChain {
    phases: Vec<Phase>,
}

impl std::fmt::Debug for HandlerChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerChain")
            .field("phases", &self.phases.iter().map(Phase::name).collect::<Vec<_>>())
            .field("handlers", &self.handler_names())
            .finish()
    }
}

impl HandlerChain {
    pub fn builder() -> ChainBuilder {
        ChainBuilder::default()
    }

    /// Create and initialize every configured handler.
    ///
    /// Handler names must be non-empty and unique across the chain; handlers
    /// key their per-message undo records by name.
    pub fn from_config(
        config: &EngineConfig,
        registry: &HandlerRegistry,
    ) -> Result<Self, ConfigurationError> {
        let mut builder = Self::builder();
        let mut seen: HashSet<&str> = HashSet::new();
        for phase in &config.phases {
            builder = builder.phase(&phase.name);
            for handler_config in &phase.handlers {
                let name = handler_config.name.as_str();
                let reason = if name.trim().is_empty() {
                    Some("name is empty")
                } else if !seen.insert(name) {
                    Some("name is already used in this chain")
                } else {
                    None
                };
                if let Some(reason) = reason {
                    return Err(ConfigurationError::InvalidHandlerName {
                        handler: name.to_string(),
                        phase: phase.name.clone(),
                        reason: reason.to_string(),
                    });
                }
                let description = HandlerDescription::from_config(handler_config, &phase.name);
                builder = builder.handler(registry.create(description)?);
            }
        }
        let chain = builder.build();
        info!(
            phases = chain.phases.len(),
            handlers = chain.len(),
            "Handler chain assembled"
        );
        Ok(chain)
    }

    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    /// Total number of handlers across all phases.
    pub fn len(&self) -> usize {
        self.phases.iter().map(Phase::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Handler names in execution order.
    pub fn handler_names(&self) -> Vec<&str> {
        self.handlers().map(|h| h.name()).collect()
    }

    fn handlers(&self) -> impl Iterator<Item = &Box<dyn Handler>> + '_ {
        self.phases.iter().flat_map(|p| p.handlers.iter())
    }

    /// Run `ctx` through the chain.
    ///
    /// On success the context ends in `Completed`. On a fault it ends in
    /// `RolledBack` with the fault stored in the context, and the returned
    /// error carries the original fault.
    pub fn invoke(&self, ctx: &mut MessageContext) -> Result<(), ChainFault> {
        if ctx.chain_state != ChainState::Pending {
            let fault = HandlerFault::receiver(format!(
                "message already went through a handler chain (state {:?})",
                ctx.chain_state
            ));
            warn!(message_id = ?ctx.message_id(), state = ?ctx.chain_state, "Rejected message that is not pending");
            return Err(ChainFault {
                handler: String::new(),
                index: 0,
                fault,
                secondary: Vec::new(),
            });
        }

        for (index, handler) in self.handlers().enumerate() {
            ctx.chain_state = ChainState::Running(index);
            debug!(
                message_id = ?ctx.message_id(),
                handler = %handler.name(),
                index,
                "Invoking handler"
            );
            if let Err(fault) = handler.invoke(ctx) {
                return Err(self.roll_back(ctx, index, handler.name(), fault));
            }
        }

        ctx.chain_state = ChainState::Completed;
        debug!(message_id = ?ctx.message_id(), handlers = self.len(), "Handler chain completed");
        Ok(())
    }

    fn roll_back(
        &self,
        ctx: &mut MessageContext,
        index: usize,
        handler: &str,
        fault: HandlerFault,
    ) -> ChainFault {
        ctx.chain_state = ChainState::Faulted(index);
        ctx.set_fault(fault.clone());
        warn!(
            message_id = ?ctx.message_id(),
            handler = %handler,
            index,
            code = %fault.code.as_str(),
            reason = %fault.reason,
            "Handler faulted, rolling back"
        );

        let ran: Vec<&Box<dyn Handler>> = self.handlers().take(index + 1).collect();
        let mut secondary = Vec::new();
        for undo in ran.into_iter().rev() {
            if let Err(rollback_fault) = undo.on_fault(ctx) {
                warn!(
                    message_id = ?ctx.message_id(),
                    handler = %undo.name(),
                    reason = %rollback_fault,
                    "Rollback of handler failed"
                );
                secondary.push(SecondaryFault {
                    handler: undo.name().to_string(),
                    fault: rollback_fault,
                });
            }
        }

        ctx.chain_state = ChainState::RolledBack;
        ChainFault {
            handler: handler.to_string(),
            index,
            fault,
            secondary,
        }
    }

    /// Call every handler's `cleanup`, returning the failures.
    pub fn cleanup(&mut self) -> Vec<SecondaryFault> {
        let mut failures = Vec::new();
        for handler in self.phases.iter_mut().flat_map(|p| p.handlers.iter_mut()) {
            if let Err(fault) = handler.cleanup() {
                warn!(handler = %handler.name(), reason = %fault, "Handler cleanup failed");
                failures.push(SecondaryFault {
                    handler: handler.name().to_string(),
                    fault,
                });
            }
        }
        failures
    }
}

/// Assembles a [`HandlerChain`] from already initialized handlers.
#[derive(Default)]
pub struct ChainBuilder {
    phases: Vec<Phase>,
}

impl ChainBuilder {
    /// Start a new phase; following handlers join it.
    pub fn phase(mut self, name: impl Into<String>) -> Self {
        self.phases.push(Phase {
            name: name.into(),
            handlers: Vec::new(),
        });
        self
    }

    /// Append a handler to the current phase, opening a `default` phase if none exists.
    pub fn handler(mut self, handler: Box<dyn Handler>) -> Self {
        if self.phases.is_empty() {
            self = self.phase("default");
        }
        if let Some(phase) = self.phases.last_mut() {
            phase.handlers.push(handler);
        }
        self
    }

    pub fn build(self) -> HandlerChain {
        HandlerChain {
            phases: self.phases,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Document;
    use std::sync::{Arc, Mutex};

    type Journal = Arc<Mutex<Vec<String>>>;

    struct Recorder {
        description: HandlerDescription,
        journal: Journal,
        fail_invoke: bool,
        fail_undo: bool,
    }

    impl Recorder {
        fn boxed(name: &str, journal: &Journal, fail_invoke: bool, fail_undo: bool) -> Box<dyn Handler> {
            Box::new(Self {
                description: HandlerDescription::new(name, "recorder"),
                journal: journal.clone(),
                fail_invoke,
                fail_undo,
            })
        }
    }

    impl Handler for Recorder {
        fn init(&mut self, description: HandlerDescription) -> Result<(), ConfigurationError> {
            self.description = description;
            Ok(())
        }

        fn invoke(&self, _ctx: &mut MessageContext) -> Result<(), HandlerFault> {
            self.journal.lock().unwrap().push(format!("invoke:{}", self.name()));
            if self.fail_invoke {
                return Err(HandlerFault::sender(format!("{} failed", self.name())));
            }
            Ok(())
        }

        fn on_fault(&self, _ctx: &mut MessageContext) -> Result<(), HandlerFault> {
            self.journal.lock().unwrap().push(format!("undo:{}", self.name()));
            if self.fail_undo {
                return Err(HandlerFault::receiver("undo failed"));
            }
            Ok(())
        }

        fn cleanup(&mut self) -> Result<(), HandlerFault> {
            if self.fail_undo {
                return Err(HandlerFault::receiver("cleanup failed"));
            }
            Ok(())
        }

        fn description(&self) -> &HandlerDescription {
            &self.description
        }
    }

    #[test]
    fn test_all_handlers_succeed() {
        let journal = Journal::default();
        let chain = HandlerChain::builder()
            .phase("in")
            .handler(Recorder::boxed("a", &journal, false, false))
            .phase("dispatch")
            .handler(Recorder::boxed("b", &journal, false, false))
            .build();
        let mut ctx = MessageContext::new(Document::new());

        chain.invoke(&mut ctx).unwrap();
        assert_eq!(ctx.chain_state(), ChainState::Completed);
        assert_eq!(*journal.lock().unwrap(), vec!["invoke:a", "invoke:b"]);
        assert_eq!(chain.handler_names(), vec!["a", "b"]);
    }

    #[test]
    fn test_fault_rolls_back_in_reverse() {
        let journal = Journal::default();
        let chain = HandlerChain::builder()
            .handler(Recorder::boxed("a", &journal, false, false))
            .handler(Recorder::boxed("b", &journal, false, true))
            .handler(Recorder::boxed("c", &journal, true, false))
            .handler(Recorder::boxed("d", &journal, false, false))
            .build();
        let mut ctx = MessageContext::new(Document::new());

        let err = chain.invoke(&mut ctx).unwrap_err();
        assert_eq!(err.handler, "c");
        assert_eq!(err.index, 2);
        assert_eq!(err.fault.reason, "c failed");
        assert_eq!(err.secondary.len(), 1);
        assert_eq!(err.secondary[0].handler, "b");
        assert_eq!(ctx.chain_state(), ChainState::RolledBack);
        assert_eq!(ctx.fault(), Some(&err.fault));
        assert_eq!(
            *journal.lock().unwrap(),
            vec!["invoke:a", "invoke:b", "invoke:c", "undo:c", "undo:b", "undo:a"]
        );
    }

    #[test]
    fn test_context_runs_only_once() {
        let journal = Journal::default();
        let chain = HandlerChain::builder()
            .handler(Recorder::boxed("a", &journal, false, false))
            .build();
        let mut ctx = MessageContext::new(Document::new());
        chain.invoke(&mut ctx).unwrap();

        let err = chain.invoke(&mut ctx).unwrap_err();
        assert_eq!(err.fault.code, crate::error::FaultCode::Receiver);
        assert_eq!(journal.lock().unwrap().len(), 1);
        assert_eq!(ctx.chain_state(), ChainState::Completed);
    }

    #[test]
    fn test_empty_chain_completes() {
        let chain = HandlerChain::builder().build();
        let mut ctx = MessageContext::new(Document::new());
        chain.invoke(&mut ctx).unwrap();
        assert!(chain.is_empty());
        assert_eq!(ctx.chain_state(), ChainState::Completed);
    }

    #[test]
    fn test_cleanup_collects_failures() {
        let journal = Journal::default();
        let mut chain = HandlerChain::builder()
            .handler(Recorder::boxed("ok", &journal, false, false))
            .handler(Recorder::boxed("bad", &journal, false, true))
            .build();
        let failures = chain.cleanup();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].handler, "bad");
    }
}
