// Copyright (C) 2026 StarHuntingGames
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};

pub const MIN_WORD_LENGTH: usize = 3;
pub const MAX_WORD_LENGTH: usize = 10;
pub const DEFAULT_WORD_LENGTH: usize = 5;
pub const CLASSIC_MAX_GUESSES: usize = 6;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GameMode {
    Classic,
    Unlimited,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LetterScore {
    Hit,
    Present,
    Miss,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GameStatus {
    InProgress,
    Solved,
    Lost,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GuessScore {
    pub guess: String,
    pub scores: Vec<LetterScore>,
}

/// One channel's game. Serialized as-is into the state store; the `word`
/// field must never be echoed to players while the game is in progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameSnapshot {
    pub word: String,
    pub mode: GameMode,
    pub guesses: Vec<GuessScore>,
    pub status: GameStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl GameSnapshot {
    pub fn new(word: String, mode: GameMode) -> Self {
        let now = Utc::now();
        Self {
            word,
            mode,
            guesses: Vec::new(),
            status: GameStatus::InProgress,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn word_length(&self) -> usize {
        self.word.chars().count()
    }

    pub fn max_guesses(&self) -> Option<usize> {
        match self.mode {
            GameMode::Classic => Some(CLASSIC_MAX_GUESSES),
            GameMode::Unlimited => None,
        }
    }

    pub fn remaining_guesses(&self) -> Option<usize> {
        self.max_guesses()
            .map(|max| max.saturating_sub(self.guesses.len()))
    }

    /// Score `guess` against the answer and record it. The caller must have
    /// validated length and character set, and the game must be in progress.
    pub fn apply_guess(&mut self, guess: &str) -> GuessScore {
        let scores = score_guess(&self.word, guess);
        let solved = !scores.is_empty() && scores.iter().all(|score| *score == LetterScore::Hit);
        let entry = GuessScore {
            guess: guess.to_string(),
            scores,
        };
        self.guesses.push(entry.clone());
        self.updated_at = Utc::now();

        if solved {
            self.status = GameStatus::Solved;
        } else if self
            .max_guesses()
            .is_some_and(|max| self.guesses.len() >= max)
        {
            self.status = GameStatus::Lost;
        }

        entry
    }
}

/// Classic scoring: exact positions claim their letters first, then leftover
/// letters satisfy out-of-position guesses left to right.
pub fn score_guess(word: &str, guess: &str) -> Vec<LetterScore> {
    let word_chars: Vec<char> = word.chars().collect();
    let guess_chars: Vec<char> = guess.chars().collect();

    let mut leftover: HashMap<char, usize> = HashMap::new();
    for (index, letter) in word_chars.iter().enumerate() {
        if guess_chars.get(index) != Some(letter) {
            *leftover.entry(*letter).or_insert(0) += 1;
        }
    }

    let mut scores = Vec::with_capacity(guess_chars.len());
    for (index, letter) in guess_chars.iter().enumerate() {
        if word_chars.get(index) == Some(letter) {
            scores.push(LetterScore::Hit);
        } else if leftover.get(letter).copied().unwrap_or(0) > 0 {
            *leftover.get_mut(letter).unwrap() -= 1;
            scores.push(LetterScore::Present);
        } else {
            scores.push(LetterScore::Miss);
        }
    }

    scores
}

/// Lowercase and validate a raw guess. Returns `None` for anything that is
/// not purely ASCII letters.
pub fn normalize_guess(raw: &str) -> Option<String> {
    let candidate = raw.trim().to_lowercase();
    let re = Regex::new(r"^[a-z]+$").unwrap();
    if re.is_match(&candidate) {
        Some(candidate)
    } else {
        None
    }
}

pub fn render_board(snapshot: &GameSnapshot) -> String {
    snapshot
        .guesses
        .iter()
        .map(|entry| {
            let squares: String = entry
                .scores
                .iter()
                .map(|score| match score {
                    LetterScore::Hit => '🟩',
                    LetterScore::Present => '🟨',
                    LetterScore::Miss => '⬛',
                })
                .collect();
            format!("{} {}", squares, entry.guess)
        })
        .collect::<Vec<String>>()
        .join("\n")
}

#[derive(Debug, Default)]
pub struct WordList {
    by_length: HashMap<usize, Vec<String>>,
    known: HashSet<String>,
}

impl WordList {
    /// Parse a newline-delimited word list. Words are lowercased; anything
    /// outside the supported lengths or containing non-letters is dropped.
    pub fn parse(raw: &str) -> Self {
        let mut list = Self::default();
        for line in raw.lines() {
            let word = line.trim().to_lowercase();
            let length = word.chars().count();
            if !(MIN_WORD_LENGTH..=MAX_WORD_LENGTH).contains(&length) {
                continue;
            }
            if !word.chars().all(|letter| letter.is_ascii_lowercase()) {
                continue;
            }
            if list.known.insert(word.clone()) {
                list.by_length.entry(length).or_default().push(word);
            }
        }
        list
    }

    pub fn len(&self) -> usize {
        self.known.len()
    }

    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }

    pub fn contains(&self, word: &str) -> bool {
        self.known.contains(word)
    }

    pub fn available_lengths(&self) -> Vec<usize> {
        let mut lengths: Vec<usize> = self.by_length.keys().copied().collect();
        lengths.sort_unstable();
        lengths
    }

    pub fn pick(&self, length: usize) -> Option<&str> {
        let candidates = self.by_length.get(&length)?;
        let mut rng = rand::rng();
        let index = rng.random_range(0..candidates.len());
        Some(candidates[index].as_str())
    }
}

/// Replace `${VAR_NAME}` patterns in a string with values from environment variables.
/// Unknown or unset variables are replaced with an empty string.
pub fn expand_env_vars(input: &str) -> String {
    let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap();
    re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        std::env::var(var_name).unwrap_or_default()
    })
    .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn score_guess_marks_exact_and_out_of_position_letters() {
        let scores = score_guess("sassy", "space");
        assert_eq!(
            scores,
            vec![
                LetterScore::Hit,
                LetterScore::Miss,
                LetterScore::Present,
                LetterScore::Miss,
                LetterScore::Miss,
            ]
        );
    }

    #[test]
    fn score_guess_does_not_overcount_duplicate_letters() {
        // "geese" has three e's; two are consumed by exact matches, leaving
        // one for the leading out-of-position e.
        let scores = score_guess("geese", "eerie");
        assert_eq!(
            scores,
            vec![
                LetterScore::Present,
                LetterScore::Hit,
                LetterScore::Miss,
                LetterScore::Miss,
                LetterScore::Hit,
            ]
        );
    }

    #[test]
    fn score_guess_all_hits_for_exact_word() {
        let scores = score_guess("crane", "crane");
        assert!(scores.iter().all(|score| *score == LetterScore::Hit));
        assert_eq!(scores.len(), 5);
    }

    #[test]
    fn apply_guess_solves_on_exact_match() {
        let mut game = GameSnapshot::new("crane".to_string(), GameMode::Classic);
        let entry = game.apply_guess("crane");
        assert_eq!(game.status, GameStatus::Solved);
        assert_eq!(entry.guess, "crane");
        assert_eq!(game.guesses.len(), 1);
    }

    #[test]
    fn apply_guess_loses_classic_game_after_max_guesses() {
        let mut game = GameSnapshot::new("crane".to_string(), GameMode::Classic);
        for _ in 0..CLASSIC_MAX_GUESSES {
            assert_eq!(game.status, GameStatus::InProgress);
            game.apply_guess("slate");
        }
        assert_eq!(game.status, GameStatus::Lost);
        assert_eq!(game.remaining_guesses(), Some(0));
    }

    #[test]
    fn apply_guess_never_loses_unlimited_game() {
        let mut game = GameSnapshot::new("crane".to_string(), GameMode::Unlimited);
        for _ in 0..(CLASSIC_MAX_GUESSES * 2) {
            game.apply_guess("slate");
        }
        assert_eq!(game.status, GameStatus::InProgress);
        assert_eq!(game.remaining_guesses(), None);
    }

    #[test]
    fn normalize_guess_trims_and_lowercases() {
        assert_eq!(normalize_guess("  CrAnE  "), Some("crane".to_string()));
    }

    #[test]
    fn normalize_guess_rejects_non_letters() {
        assert_eq!(normalize_guess("cr4ne"), None);
        assert_eq!(normalize_guess("cra ne"), None);
        assert_eq!(normalize_guess(""), None);
    }

    #[test]
    fn render_board_shows_one_row_per_guess() {
        let mut game = GameSnapshot::new("sassy".to_string(), GameMode::Classic);
        game.apply_guess("space");
        game.apply_guess("sassy");

        let board = render_board(&game);
        let rows: Vec<&str> = board.lines().collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0], "🟩⬛🟨⬛⬛ space");
        assert_eq!(rows[1], "🟩🟩🟩🟩🟩 sassy");
    }

    #[test]
    fn word_list_parse_filters_and_dedupes() {
        let list = WordList::parse("crane\nCRANE\nxy\nthisiswaytoolong\ncr4ne\nslate\n");
        assert_eq!(list.len(), 2);
        assert!(list.contains("crane"));
        assert!(list.contains("slate"));
        assert!(!list.contains("xy"));
        assert!(!list.contains("cr4ne"));
        assert_eq!(list.available_lengths(), vec![5]);
    }

    #[test]
    fn word_list_pick_honors_requested_length() {
        let list = WordList::parse("cat\ncrane\nslate\n");
        assert_eq!(list.pick(3), Some("cat"));
        let five = list.pick(5).unwrap();
        assert!(["crane", "slate"].contains(&five));
        assert_eq!(list.pick(7), None);
    }

    #[test]
    fn expand_env_vars_replaces_unknown_vars_with_empty() {
        assert_eq!(
            expand_env_vars("a=${WORDBOT_TEST_SURELY_UNSET_VAR},b=1"),
            "a=,b=1"
        );
        assert_eq!(expand_env_vars("no placeholders"), "no placeholders");
    }
}
