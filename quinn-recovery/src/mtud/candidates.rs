//! Strategies choosing the next PMTU probe size
//!
//! Every strategy proposes sizes strictly above the confirmed PMTU and no larger than the current
//! ceiling, which is the discovery upper bound or one less than the smallest size known to fail.

use std::ops::{Deref, DerefMut};

use crate::{CandidateSequenceKind, MtuDiscoveryConfig};

/// What is known about the path while searching
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) struct Bounds {
    /// Largest size confirmed to work
    pub(crate) lower: u16,
    /// Largest size the search may reach
    pub(crate) max: u16,
    /// Smallest size known not to work
    pub(crate) smallest_failed: Option<u16>,
}

impl Bounds {
    pub(crate) fn new(lower: u16, max: u16) -> Self {
        Self {
            lower,
            max,
            smallest_failed: None,
        }
    }

    /// Largest size that may still work
    pub(crate) fn upper(&self) -> u16 {
        self.smallest_failed
            .map_or(self.max, |failed| failed.saturating_sub(1))
            .min(self.max)
    }

    fn on_success(&mut self, size: u16) {
        self.lower = self.lower.max(size);
        if self.smallest_failed.is_some_and(|failed| failed <= size) {
            // The path changed under our feet, the old failure is stale
            self.smallest_failed = None;
        }
    }

    fn on_failure(&mut self, size: u16) {
        if size > self.lower {
            self.smallest_failed = Some(self.smallest_failed.map_or(size, |x| x.min(size)));
        }
    }
}

/// A strategy deciding which untested size to probe next
pub(crate) trait CandidateSequence {
    fn bounds(&self) -> &Bounds;

    fn bounds_mut(&mut self) -> &mut Bounds;

    /// Size of the next probe, or `None` when the search is over
    fn next_candidate(&mut self) -> Option<u16>;

    /// A probe of `size` bytes was acknowledged
    fn on_success(&mut self, size: u16) {
        self.bounds_mut().on_success(size);
    }

    /// Probes of `size` bytes were lost too many times
    fn on_failure(&mut self, size: u16) {
        self.bounds_mut().on_failure(size);
    }
}

/// Binary search step shared by the binary strategies
fn binary_candidate(bounds: &Bounds, minimum_change: u16) -> Option<u16> {
    let (lower, upper) = (bounds.lower, bounds.upper());
    if upper <= lower {
        return None;
    }
    if upper - lower < minimum_change {
        // The range is too small to split further, but an untested upper bound is worth a final
        // probe or the search would never reach it
        return bounds.smallest_failed.is_none().then_some(upper);
    }
    Some(lower + (upper - lower + 1) / 2)
}

/// Linear step shared by the upward strategies
fn up_candidate(bounds: &Bounds, step: u16) -> Option<u16> {
    let (lower, upper) = (bounds.lower, bounds.upper());
    let next = lower.saturating_add(step);
    if next <= upper {
        return Some(next);
    }
    (bounds.smallest_failed.is_none() && upper > lower).then_some(upper)
}

/// Walk up from the confirmed PMTU in fixed steps
#[derive(Debug, Clone)]
pub(crate) struct Up {
    bounds: Bounds,
    step: u16,
}

impl CandidateSequence for Up {
    fn bounds(&self) -> &Bounds {
        &self.bounds
    }

    fn bounds_mut(&mut self) -> &mut Bounds {
        &mut self.bounds
    }

    fn next_candidate(&mut self) -> Option<u16> {
        up_candidate(&self.bounds, self.step)
    }
}

/// Walk down from the upper bound in fixed steps until a probe gets through
#[derive(Debug, Clone)]
pub(crate) struct Down {
    bounds: Bounds,
    step: u16,
}

impl CandidateSequence for Down {
    fn bounds(&self) -> &Bounds {
        &self.bounds
    }

    fn bounds_mut(&mut self) -> &mut Bounds {
        &mut self.bounds
    }

    fn next_candidate(&mut self) -> Option<u16> {
        let next = match self.bounds.smallest_failed {
            None => self.bounds.upper(),
            Some(failed) => failed.saturating_sub(self.step),
        };
        (next > self.bounds.lower).then_some(next)
    }
}

/// Binary search between the confirmed PMTU and the upper bound
#[derive(Debug, Clone)]
pub(crate) struct Binary {
    bounds: Bounds,
    minimum_change: u16,
}

impl CandidateSequence for Binary {
    fn bounds(&self) -> &Bounds {
        &self.bounds
    }

    fn bounds_mut(&mut self) -> &mut Bounds {
        &mut self.bounds
    }

    fn next_candidate(&mut self) -> Option<u16> {
        binary_candidate(&self.bounds, self.minimum_change)
    }
}

/// Probe the upper bound first, hoping the path supports it, then binary search
#[derive(Debug, Clone)]
pub(crate) struct OptBinary {
    bounds: Bounds,
    minimum_change: u16,
    tried_upper: bool,
}

impl CandidateSequence for OptBinary {
    fn bounds(&self) -> &Bounds {
        &self.bounds
    }

    fn bounds_mut(&mut self) -> &mut Bounds {
        &mut self.bounds
    }

    fn next_candidate(&mut self) -> Option<u16> {
        if !self.tried_upper {
            self.tried_upper = true;
            if self.bounds.upper() > self.bounds.lower {
                return Some(self.bounds.upper());
            }
        }
        binary_candidate(&self.bounds, self.minimum_change)
    }
}

/// Probe the upper bound first, then walk up in fixed steps
#[derive(Debug, Clone)]
pub(crate) struct OptUp {
    bounds: Bounds,
    step: u16,
    tried_upper: bool,
}

impl CandidateSequence for OptUp {
    fn bounds(&self) -> &Bounds {
        &self.bounds
    }

    fn bounds_mut(&mut self) -> &mut Bounds {
        &mut self.bounds
    }

    fn next_candidate(&mut self) -> Option<u16> {
        if !self.tried_upper {
            self.tried_upper = true;
            if self.bounds.upper() > self.bounds.lower {
                return Some(self.bounds.upper());
            }
        }
        up_candidate(&self.bounds, self.step)
    }
}

/// Probe well-known payload sizes in increasing order, then refine the gap between the largest
/// working and the smallest failing one with binary search
#[derive(Debug, Clone)]
pub(crate) struct Jump {
    bounds: Bounds,
    sizes: Vec<u16>,
    minimum_change: u16,
}

impl CandidateSequence for Jump {
    fn bounds(&self) -> &Bounds {
        &self.bounds
    }

    fn bounds_mut(&mut self) -> &mut Bounds {
        &mut self.bounds
    }

    fn next_candidate(&mut self) -> Option<u16> {
        let (lower, upper) = (self.bounds.lower, self.bounds.upper());
        self.sizes
            .iter()
            .copied()
            .find(|&size| lower < size && size <= upper)
            .or_else(|| binary_candidate(&self.bounds, self.minimum_change))
    }
}

/// The candidate sequence of a search, selected by [`CandidateSequenceKind`]
#[derive(Debug, Clone)]
pub(crate) enum Candidates {
    Up(Up),
    Down(Down),
    Binary(Binary),
    OptBinary(OptBinary),
    OptUp(OptUp),
    Jump(Jump),
}

impl Candidates {
    pub(crate) fn new(config: &MtuDiscoveryConfig, bounds: Bounds) -> Self {
        let step = config.step;
        let minimum_change = config.minimum_change;
        match config.candidate_sequence {
            CandidateSequenceKind::Up => Self::Up(Up { bounds, step }),
            CandidateSequenceKind::Down => Self::Down(Down { bounds, step }),
            CandidateSequenceKind::Binary => Self::Binary(Binary {
                bounds,
                minimum_change,
            }),
            CandidateSequenceKind::OptBinary => Self::OptBinary(OptBinary {
                bounds,
                minimum_change,
                tried_upper: false,
            }),
            CandidateSequenceKind::OptUp => Self::OptUp(OptUp {
                bounds,
                step,
                tried_upper: false,
            }),
            CandidateSequenceKind::Jump => Self::Jump(Jump {
                bounds,
                sizes: config.jump_sizes.clone(),
                minimum_change,
            }),
        }
    }
}

impl Deref for Candidates {
    type Target = dyn CandidateSequence;
    fn deref(&self) -> &Self::Target {
        match self {
            Self::Up(x) => x,
            Self::Down(x) => x,
            Self::Binary(x) => x,
            Self::OptBinary(x) => x,
            Self::OptUp(x) => x,
            Self::Jump(x) => x,
        }
    }
}

impl DerefMut for Candidates {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match self {
            Self::Up(x) => x,
            Self::Down(x) => x,
            Self::Binary(x) => x,
            Self::OptBinary(x) => x,
            Self::OptUp(x) => x,
            Self::Jump(x) => x,
        }
    }
}
