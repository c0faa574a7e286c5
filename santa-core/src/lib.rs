mod assign;

pub use assign::{
    generate_assignments, is_valid_assignment, AssignError, Assignment, AssignmentGenerator,
    Exclusions, Name, DEFAULT_MAX_ATTEMPTS,
};

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

pub type TicketNumber = u32;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Pick {
    pub picker: Name,
    pub recipient: Name,
    pub ticket_number: TicketNumber,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Ticket {
    pub number: TicketNumber,
    pub taken: bool,
}

/// Public notifications. Never carries a recipient.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum GameEvent {
    PickMade {
        picker: Name,
        ticket_number: TicketNumber,
    },
    Reset,
}

impl From<&Pick> for GameEvent {
    fn from(pick: &Pick) -> Self {
        GameEvent::PickMade {
            picker: pick.picker.clone(),
            ticket_number: pick.ticket_number,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Game {
    pub id: String,
    pub names: Vec<Name>,
    #[serde(default)]
    pub exclusions: Exclusions,
    /// Computed lazily by the first draw, cleared only by [`reset`].
    #[serde(default)]
    pub assignments: Option<Assignment>,
    #[serde(default)]
    pub picks: Vec<Pick>,
    pub created_at: u64,
}

impl Game {
    /// Normalises the roster: names are trimmed and must be unique and
    /// non-empty. Exclusion entries for unknown names or the picker
    /// themselves are dropped.
    pub fn new(
        id: impl Into<String>,
        names: Vec<Name>,
        exclusions: Exclusions,
        created_at: u64,
    ) -> Result<Self, GameError> {
        let names: Vec<Name> = names.into_iter().map(|n| n.trim().to_string()).collect();

        let mut seen = HashSet::with_capacity(names.len());
        for name in &names {
            if name.is_empty() {
                return Err(GameError::EmptyName);
            }
            if !seen.insert(name.as_str()) {
                return Err(GameError::DuplicateName(name.clone()));
            }
        }
        if names.len() < 2 {
            return Err(GameError::TooFewParticipants);
        }

        let exclusions = exclusions
            .into_iter()
            .filter_map(|(picker, excluded)| {
                let picker = picker.trim().to_string();
                if !seen.contains(picker.as_str()) {
                    return None;
                }
                let excluded: HashSet<Name> = excluded
                    .into_iter()
                    .map(|n| n.trim().to_string())
                    .filter(|n| *n != picker && seen.contains(n.as_str()))
                    .collect();
                (!excluded.is_empty()).then_some((picker, excluded))
            })
            .collect();

        Ok(Self {
            id: id.into(),
            names,
            exclusions,
            assignments: None,
            picks: Vec::new(),
            created_at,
        })
    }

    pub fn is_participant(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }

    pub fn pick_for(&self, picker: &str) -> Option<&Pick> {
        self.picks.iter().find(|p| p.picker == picker)
    }

    pub fn ticket_count(&self) -> TicketNumber {
        self.names.len() as TicketNumber
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GameError {
    #[error("at least two participants are required")]
    TooFewParticipants,
    #[error("participant names must not be empty")]
    EmptyName,
    #[error("duplicate participant name: {0}")]
    DuplicateName(Name),
    #[error("unknown participant: {0}")]
    UnknownParticipant(Name),
    #[error("ticket {0} does not exist")]
    InvalidTicket(TicketNumber),
    #[error("ticket {0} has already been claimed")]
    TicketTaken(TicketNumber),
    #[error("{} has already drawn a name", .0.picker)]
    AlreadyPicked(Pick),
    #[error("cannot create valid assignments with these exclusion rules: {0}")]
    Unsatisfiable(#[from] AssignError),
    #[error("no recipient assigned to {0}")]
    MissingRecipient(Name),
    #[error("stored assignment does not match the roster; reset the game")]
    AssignmentMismatch,
}

/// Draws `picker`'s recipient using `ticket_number`.
///
/// The first draw of a game computes the full assignment and stores it on
/// the game; later draws only look their picker up. A stored assignment that
/// no longer validates is only replaced while no picks exist. On error the
/// game is left untouched.
pub fn draw<R: Rng + ?Sized>(
    game: &mut Game,
    picker: &str,
    ticket_number: TicketNumber,
    generator: &AssignmentGenerator,
    rng: &mut R,
    now: u64,
) -> Result<Pick, GameError> {
    if !game.is_participant(picker) {
        return Err(GameError::UnknownParticipant(picker.to_string()));
    }
    if ticket_number == 0 || ticket_number > game.ticket_count() {
        return Err(GameError::InvalidTicket(ticket_number));
    }
    if game.picks.iter().any(|p| p.ticket_number == ticket_number) {
        return Err(GameError::TicketTaken(ticket_number));
    }
    if let Some(existing) = game.pick_for(picker) {
        return Err(GameError::AlreadyPicked(existing.clone()));
    }

    let stale = game
        .assignments
        .as_ref()
        .map_or(true, |a| !is_valid_assignment(&game.names, &game.exclusions, a));
    if stale {
        // Earlier picks were drawn from the stored mapping; replacing it
        // would hand their recipients out a second time.
        if !game.picks.is_empty() {
            return Err(GameError::AssignmentMismatch);
        }
        let fresh = generator.generate(&game.names, &game.exclusions, rng)?;
        game.assignments = Some(fresh);
    }

    let recipient = game
        .assignments
        .as_ref()
        .and_then(|a| a.get(picker))
        .cloned()
        .ok_or_else(|| GameError::MissingRecipient(picker.to_string()))?;

    let pick = Pick {
        picker: picker.to_string(),
        recipient,
        ticket_number,
        timestamp: now,
    };
    game.picks.push(pick.clone());
    Ok(pick)
}

/// Deletes every pick and the stored assignment.
pub fn reset(game: &mut Game) {
    game.picks.clear();
    game.assignments = None;
}

pub fn tickets(game: &Game) -> Vec<Ticket> {
    let taken = taken_tickets(game);
    (1..=game.ticket_count())
        .map(|number| Ticket {
            number,
            taken: taken.contains(&number),
        })
        .collect()
}

pub fn taken_tickets(game: &Game) -> Vec<TicketNumber> {
    let mut taken: Vec<TicketNumber> = game.picks.iter().map(|p| p.ticket_number).collect();
    taken.sort_unstable();
    taken
}

/// Participants who have not drawn yet, in roster order.
pub fn pending_pickers(game: &Game) -> Vec<&str> {
    game.names
        .iter()
        .filter(|n| game.pick_for(n).is_none())
        .map(String::as_str)
        .collect()
}
