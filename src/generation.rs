//! Asset cache generations. Bumping the record layout means appending the old
//! tag here with the action to take on disk, and moving [`CURRENT_GENERATION`].

pub const CURRENT_GENERATION: &str = "v7";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationAction {
    /// Delete every cached record of the generation and its directory.
    Purge,
}

pub const GENERATIONS: &[(&str, GenerationAction)] = &[
    ("v1", GenerationAction::Purge),
    ("v2", GenerationAction::Purge),
    ("v3", GenerationAction::Purge),
    ("v5", GenerationAction::Purge),
    ("v6", GenerationAction::Purge),
];

pub fn superseded() -> impl Iterator<Item = &'static str> {
    GENERATIONS
        .iter()
        .filter(|(_, action)| *action == GenerationAction::Purge)
        .map(|(tag, _)| *tag)
}
