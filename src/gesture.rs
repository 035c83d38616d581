// src/gesture.rs - Direction quantization and substring gesture matching
use std::collections::VecDeque;
use std::fmt;

use nalgebra::Point2;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Left,
    Right,
    Up,
    Down,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Left => "left",
            Self::Right => "right",
            Self::Up => "up",
            Self::Down => "down",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Gesture {
    Lumos,
    Nox,
    Colovaria,
}

impl Gesture {
    /// Match order: the first gesture whose pattern is in the history wins.
    pub const PRIORITY: [Gesture; 3] = [Gesture::Lumos, Gesture::Nox, Gesture::Colovaria];

    pub fn pattern(&self) -> [Direction; 2] {
        match self {
            Self::Lumos => [Direction::Right, Direction::Up],
            Self::Nox => [Direction::Right, Direction::Down],
            Self::Colovaria => [Direction::Left, Direction::Down],
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Lumos => "Lumos",
            Self::Nox => "Nox",
            Self::Colovaria => "Colovaria",
        }
    }
}

impl fmt::Display for Gesture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Displacement along the move axis needed to count as a move.
    pub min_step: f32,
    /// Allowed vertical drift for a left/right move.
    pub horizontal_tolerance: f32,
    /// Allowed horizontal drift for an up/down move.
    pub vertical_tolerance: f32,
    /// Only tracks with an id below this are classified.
    pub max_classified_tracks: usize,
    /// Keep only the newest moves per track; `None` keeps the whole epoch.
    pub history_limit: Option<usize>,
    /// Clear a track's history once it casts, instead of re-firing every frame.
    pub consume_on_match: bool,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            min_step: 5.0,
            horizontal_tolerance: 1.0,
            vertical_tolerance: 5.0,
            max_classified_tracks: 15,
            history_limit: None,
            consume_on_match: false,
        }
    }
}

/// Every move that `old -> new` qualifies as, in left, right, up, down order.
pub fn quantize(old: Point2<f32>, new: Point2<f32>, config: &ClassifierConfig) -> Vec<Direction> {
    let (a, b) = (new.x, new.y);
    let (c, d) = (old.x, old.y);
    let step = config.min_step;

    let mut moves = Vec::with_capacity(1);
    if a < c - step && (b - d).abs() < config.horizontal_tolerance {
        moves.push(Direction::Left);
    }
    if c < a - step && (b - d).abs() < config.horizontal_tolerance {
        moves.push(Direction::Right);
    }
    if b < d - step && (a - c).abs() < config.vertical_tolerance {
        moves.push(Direction::Up);
    }
    if d < b - step && (a - c).abs() < config.vertical_tolerance {
        moves.push(Direction::Down);
    }
    moves
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct History {
    moves: VecDeque<Direction>,
    limit: Option<usize>,
}

impl History {
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            moves: VecDeque::new(),
            limit,
        }
    }

    pub fn push(&mut self, direction: Direction) {
        self.moves.push_back(direction);
        if let Some(limit) = self.limit {
            while self.moves.len() > limit {
                self.moves.pop_front();
            }
        }
    }

    pub fn contains(&self, pattern: &[Direction]) -> bool {
        if pattern.is_empty() || pattern.len() > self.moves.len() {
            return false;
        }
        (0..=self.moves.len() - pattern.len())
            .any(|start| pattern.iter().enumerate().all(|(i, d)| self.moves[start + i] == *d))
    }

    pub fn is_empty(&self) -> bool {
        self.moves.is_empty()
    }

    pub fn clear(&mut self) {
        self.moves.clear();
    }
}

impl fmt::Display for History {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for direction in &self.moves {
            f.write_str(direction.as_str())?;
        }
        Ok(())
    }
}

pub struct GestureClassifier {
    config: ClassifierConfig,
    histories: Vec<History>,
}

impl GestureClassifier {
    pub fn new(config: ClassifierConfig) -> Self {
        Self {
            config,
            histories: Vec::new(),
        }
    }

    /// Starts a new epoch: every track's history is dropped.
    pub fn reset(&mut self) {
        self.histories.clear();
    }

    pub fn history(&self, track_id: usize) -> Option<&History> {
        self.histories.get(track_id)
    }

    pub fn is_eligible(&self, track_id: usize) -> bool {
        track_id < self.config.max_classified_tracks
    }

    /// Records the move from `old` to `new` for `track_id` and reports the
    /// highest-priority gesture now present in its history.
    pub fn classify(&mut self, track_id: usize, old: Point2<f32>, new: Point2<f32>) -> Option<Gesture> {
        if !self.is_eligible(track_id) {
            return None;
        }
        if self.histories.len() <= track_id {
            let limit = self.config.history_limit;
            self.histories.resize_with(track_id + 1, || History::new(limit));
        }

        let moves = quantize(old, new, &self.config);
        let history = &mut self.histories[track_id];
        for direction in moves {
            history.push(direction);
        }
        tracing::trace!("track {} history: {}", track_id, history);

        let gesture = Gesture::PRIORITY
            .into_iter()
            .find(|g| history.contains(&g.pattern()))?;
        if self.config.consume_on_match {
            history.clear();
        }
        Some(gesture)
    }
}
