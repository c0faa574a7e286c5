//! Picker -> recipient assignment.
//!
//! The generator runs a randomized depth-first search over pickers. Each
//! tentative pairing is followed by a cheap lookahead that only checks every
//! later picker still has *some* open recipient; it does not prove a full
//! matching exists. A failed attempt is retried from scratch with fresh
//! shuffles until the attempt budget runs out.

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

pub type Name = String;
pub type Exclusions = HashMap<Name, HashSet<Name>>;
pub type Assignment = HashMap<Name, Name>;

pub const DEFAULT_MAX_ATTEMPTS: usize = 10;

#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum AssignError {
    #[error("at least two participants are required")]
    TooFewParticipants,
    #[error("participant names must not be empty")]
    EmptyName,
    #[error("duplicate participant name: {name}")]
    DuplicateName { name: Name },
    #[error("no valid assignment found within {attempts} attempts")]
    Infeasible { attempts: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssignmentGenerator {
    max_attempts: usize,
}

impl Default for AssignmentGenerator {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl AssignmentGenerator {
    /// A budget of zero is bumped to a single attempt.
    pub fn new(max_attempts: usize) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    /// Returns a complete assignment or [`AssignError::Infeasible`] once every
    /// attempt has been exhausted. Infeasible means "not found within budget",
    /// not a proof that no assignment exists.
    pub fn generate<R: Rng + ?Sized>(
        &self,
        names: &[Name],
        exclusions: &Exclusions,
        rng: &mut R,
    ) -> Result<Assignment, AssignError> {
        check_roster(names)?;
        let allowed = allowed_pairs(names, exclusions);

        for _ in 0..self.max_attempts {
            let mut search = Search::new(&allowed, rng);
            if search.extend(0, rng) {
                return Ok(search.into_assignment(names));
            }
        }

        Err(AssignError::Infeasible {
            attempts: self.max_attempts,
        })
    }
}

/// Default budget, thread-local randomness.
pub fn generate_assignments(
    names: &[Name],
    exclusions: &Exclusions,
) -> Result<Assignment, AssignError> {
    AssignmentGenerator::default().generate(names, exclusions, &mut rand::thread_rng())
}

/// Checks that `assignment` is a derangement of `names` honouring `exclusions`.
pub fn is_valid_assignment(
    names: &[Name],
    exclusions: &Exclusions,
    assignment: &Assignment,
) -> bool {
    if assignment.len() != names.len() {
        return false;
    }
    let roster: HashSet<&str> = names.iter().map(String::as_str).collect();
    if roster.len() != names.len() {
        return false;
    }

    let mut received = HashSet::with_capacity(names.len());
    names.iter().all(|picker| {
        let Some(recipient) = assignment.get(picker) else {
            return false;
        };
        recipient != picker
            && roster.contains(recipient.as_str())
            && !is_excluded(exclusions, picker, recipient)
            && received.insert(recipient.as_str())
    })
}

fn is_excluded(exclusions: &Exclusions, picker: &str, recipient: &str) -> bool {
    exclusions
        .get(picker)
        .is_some_and(|set| set.contains(recipient))
}

fn check_roster(names: &[Name]) -> Result<(), AssignError> {
    if names.len() < 2 {
        return Err(AssignError::TooFewParticipants);
    }
    let mut seen = HashSet::with_capacity(names.len());
    for name in names {
        if name.is_empty() {
            return Err(AssignError::EmptyName);
        }
        if !seen.insert(name.as_str()) {
            return Err(AssignError::DuplicateName { name: name.clone() });
        }
    }
    Ok(())
}

/// `allowed[p][r]` is true when picker `p` may draw recipient `r`.
/// Exclusion entries that name nobody on the roster simply never match.
fn allowed_pairs(names: &[Name], exclusions: &Exclusions) -> Vec<Vec<bool>> {
    names
        .iter()
        .enumerate()
        .map(|(p, picker)| {
            names
                .iter()
                .enumerate()
                .map(|(r, recipient)| p != r && !is_excluded(exclusions, picker, recipient))
                .collect()
        })
        .collect()
}

/// Search state for one attempt. Owned by a single `generate` call.
struct Search<'a> {
    allowed: &'a [Vec<bool>],
    order: Vec<usize>,
    recipient_of: Vec<Option<usize>>,
    taken: Vec<bool>,
}

impl<'a> Search<'a> {
    fn new<R: Rng + ?Sized>(allowed: &'a [Vec<bool>], rng: &mut R) -> Self {
        let n = allowed.len();
        let mut order: Vec<usize> = (0..n).collect();
        order.shuffle(rng);
        Self {
            allowed,
            order,
            recipient_of: vec![None; n],
            taken: vec![false; n],
        }
    }

    fn extend<R: Rng + ?Sized>(&mut self, depth: usize, rng: &mut R) -> bool {
        let Some(&picker) = self.order.get(depth) else {
            return true;
        };

        let mut candidates = self.open_recipients(picker);
        candidates.shuffle(rng);

        for recipient in candidates {
            self.recipient_of[picker] = Some(recipient);
            self.taken[recipient] = true;

            if self.later_pickers_viable(depth + 1) && self.extend(depth + 1, rng) {
                return true;
            }

            self.recipient_of[picker] = None;
            self.taken[recipient] = false;
        }
        false
    }

    fn open_recipients(&self, picker: usize) -> Vec<usize> {
        self.allowed[picker]
            .iter()
            .enumerate()
            .filter(|&(r, &ok)| ok && !self.taken[r])
            .map(|(r, _)| r)
            .collect()
    }

    fn later_pickers_viable(&self, from: usize) -> bool {
        self.order[from..].iter().all(|&picker| {
            self.allowed[picker]
                .iter()
                .zip(&self.taken)
                .any(|(&ok, &taken)| ok && !taken)
        })
    }

    fn into_assignment(self, names: &[Name]) -> Assignment {
        self.recipient_of
            .iter()
            .enumerate()
            .filter_map(|(p, r)| r.map(|r| (names[p].clone(), names[r].clone())))
            .collect()
    }
}
