//! Ordered attempt strategies for one render job.
//!
//! A job runs its plan front to back: the requested parameters, then
//! progressively degraded variants, then a placeholder. The executor stops
//! at the first strategy that yields a valid file.

use molview_core::render::{RenderParameters, Representation};

/// One step of a job's attempt plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptStrategy {
    /// Render exactly what was requested.
    Requested,
    /// Render at a lower resolution with a cheaper representation.
    Degraded {
        width: u32,
        height: u32,
        representation: Representation,
    },
    /// Skip the worker and synthesize a placeholder image.
    Placeholder,
}

impl AttemptStrategy {
    /// Parameters to render with, or `None` for the placeholder.
    pub fn apply(&self, params: &RenderParameters) -> Option<RenderParameters> {
        match self {
            Self::Requested => Some(params.clone()),
            Self::Degraded {
                width,
                height,
                representation,
            } => {
                let mut degraded = params.clone();
                degraded.width = *width;
                degraded.height = *height;
                degraded.style.representation = *representation;
                Some(degraded)
            }
            Self::Placeholder => None,
        }
    }

    /// Short label for logs and job messages.
    pub fn describe(&self) -> String {
        match self {
            Self::Requested => "requested parameters".to_string(),
            Self::Degraded {
                width,
                height,
                representation,
            } => format!("fallback {width}x{height} {}", representation.as_str()),
            Self::Placeholder => "placeholder".to_string(),
        }
    }
}

/// Build the attempt plan for `params`.
///
/// Always `max_attempts` render strategies (at least one) followed by
/// [`AttemptStrategy::Placeholder`]. Degraded attempt `n` (1-based) uses
/// `fallback_resolutions[n - 1]`, repeating the last entry when the list
/// is shorter, and never exceeds the requested size. Its representation is
/// simplified `n` times.
pub fn plan_attempts(
    params: &RenderParameters,
    max_attempts: u32,
    fallback_resolutions: &[(u32, u32)],
) -> Vec<AttemptStrategy> {
    let mut plan = vec![AttemptStrategy::Requested];

    let mut representation = params.style.representation;
    for degraded in 1..max_attempts.max(1) {
        representation = representation.simpler();
        let (width, height) = fallback_resolutions
            .get(degraded as usize - 1)
            .or_else(|| fallback_resolutions.last())
            .copied()
            .unwrap_or((params.width, params.height));

        plan.push(AttemptStrategy::Degraded {
            width: width.min(params.width),
            height: height.min(params.height),
            representation,
        });
    }

    plan.push(AttemptStrategy::Placeholder);
    plan
}
