use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use crate::error::ConfigurationError;
use crate::inbox::InboxConfiguration;

/// Whether a step runs before or after the business handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Timing {
    Before,
    After,
}

impl Timing {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Before => "before",
            Self::After => "after",
        }
    }
}

impl fmt::Display for Timing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a pipeline step does.
#[derive(Debug, Clone, PartialEq)]
pub enum StepKind {
    /// Logs the request on entry and the outcome with elapsed time on exit.
    RequestLogging,
    /// Wraps the rest of the chain in named policies; the first name is outermost.
    UsePolicy(Vec<String>),
    /// Cancels the rest of the chain after a fixed delay.
    Timeout(Duration),
    /// Once-only gate backed by the processor's inbox.
    UseInbox(InboxConfiguration),
    /// A middleware registered under this name for the request type.
    Custom(String),
}

impl StepKind {
    /// Short label used in pipeline descriptions.
    #[must_use]
    pub fn label(&self) -> String {
        match self {
            Self::RequestLogging => "logging".to_string(),
            Self::UsePolicy(names) => format!("policy[{}]", names.join(",")),
            Self::Timeout(d) => format!("timeout[{}ms]", d.as_millis()),
            Self::UseInbox(_) => "inbox".to_string(),
            Self::Custom(name) => name.clone(),
        }
    }
}

/// Declarative placement of one step in a handler's pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct StepDescriptor {
    pub step: u32,
    pub timing: Timing,
    pub kind: StepKind,
}

impl StepDescriptor {
    #[must_use]
    pub fn before(step: u32, kind: StepKind) -> Self {
        Self {
            step,
            timing: Timing::Before,
            kind,
        }
    }

    #[must_use]
    pub fn after(step: u32, kind: StepKind) -> Self {
        Self {
            step,
            timing: Timing::After,
            kind,
        }
    }
}

/// Splits descriptors into ascending before- and after-lists.
///
/// Fails if two descriptors share a step ordinal for the same timing.
pub(crate) fn order_steps(
    handler: &str,
    steps: &[StepDescriptor],
) -> Result<(Vec<StepDescriptor>, Vec<StepDescriptor>), ConfigurationError> {
    let mut seen = HashSet::new();
    for d in steps {
        if !seen.insert((d.timing, d.step)) {
            return Err(ConfigurationError::DuplicateStep {
                handler: handler.to_string(),
                timing: d.timing.as_str(),
                step: d.step,
            });
        }
    }

    let mut sorted = steps.to_vec();
    sorted.sort_by_key(|d| (d.timing, d.step));
    let (before, after) = sorted.into_iter().partition(|d| d.timing == Timing::Before);
    Ok((before, after))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steps_are_sorted_per_timing() {
        let steps = vec![
            StepDescriptor::after(2, StepKind::Custom("audit".into())),
            StepDescriptor::before(2, StepKind::Custom("validation".into())),
            StepDescriptor::after(1, StepKind::RequestLogging),
            StepDescriptor::before(1, StepKind::RequestLogging),
        ];
        let (before, after) = order_steps("h", &steps).unwrap();
        assert_eq!(before.iter().map(|d| d.step).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(after.iter().map(|d| d.step).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(before[1].kind, StepKind::Custom("validation".into()));
    }

    #[test]
    fn same_ordinal_different_timing_is_allowed() {
        let steps = vec![
            StepDescriptor::before(1, StepKind::RequestLogging),
            StepDescriptor::after(1, StepKind::RequestLogging),
        ];
        assert!(order_steps("h", &steps).is_ok());
    }

    #[test]
    fn duplicate_ordinal_is_rejected() {
        let steps = vec![
            StepDescriptor::before(1, StepKind::RequestLogging),
            StepDescriptor::before(1, StepKind::Custom("validation".into())),
        ];
        let err = order_steps("place_order", &steps).unwrap_err();
        assert!(matches!(
            err,
            ConfigurationError::DuplicateStep { step: 1, timing: "before", .. }
        ));
    }

    #[test]
    fn labels() {
        assert_eq!(
            StepKind::UsePolicy(vec!["retry".into(), "breaker".into()]).label(),
            "policy[retry,breaker]"
        );
        assert_eq!(StepKind::Timeout(Duration::from_millis(250)).label(), "timeout[250ms]");
    }
}
