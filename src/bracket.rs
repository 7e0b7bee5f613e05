// ====================================================================================
// src/bracket.rs - 单败淘汰赛对阵树（构建与晋级）
// ====================================================================================
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const MIN_TEAMS: usize = 2;
pub const MAX_TEAMS: usize = 1024;

// 表示“空位/待定”的占位值，统一规范为未占用
const PLACEHOLDERS: [&str; 4] = ["empty", "tbd", "to-be-decided", "null"];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BracketError {
    #[error("a bracket needs at least 2 teams, got {0}")]
    TooFewTeams(usize),
    #[error("a bracket supports at most 1024 teams, got {0}")]
    TooManyTeams(usize),
    #[error("match index {0} is outside the bracket")]
    UnknownMatch(usize),
    #[error("winner {winner} is not playing in match {index}")]
    WinnerNotInMatch { index: usize, winner: String },
    #[error("malformed bracket: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    Pending,
    Live,
    Completed,
}

impl MatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchStatus::Pending => "pending",
            MatchStatus::Live => "live",
            MatchStatus::Completed => "completed",
        }
    }
}

impl FromStr for MatchStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(MatchStatus::Pending),
            "live" => Ok(MatchStatus::Live),
            "completed" => Ok(MatchStatus::Completed),
            other => Err(format!("unknown match status {:?}", other)),
        }
    }
}

impl fmt::Display for MatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side of the downstream match a result lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Team1,
    Team2,
}

impl Slot {
    /// Even positions feed team1 of the next match, odd positions feed team2.
    pub fn fed_by(position: usize) -> Slot {
        if position % 2 == 0 { Slot::Team1 } else { Slot::Team2 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchNode {
    pub round_number: u32,
    /// Index of this match within its round.
    pub position: usize,
    pub team1: Option<String>,
    pub team2: Option<String>,
    pub team1_score: i64,
    pub team2_score: i64,
    pub winner: Option<String>,
    pub status: MatchStatus,
    /// Arena index of the match this one feeds; `None` for the final.
    pub next_match: Option<usize>,
}

impl MatchNode {
    fn empty(round_number: u32, position: usize, next_match: Option<usize>) -> Self {
        Self {
            round_number,
            position,
            team1: None,
            team2: None,
            team1_score: 0,
            team2_score: 0,
            winner: None,
            status: MatchStatus::Pending,
            next_match,
        }
    }

    #[cfg(test)]
    pub fn slot(&self, slot: Slot) -> Option<&str> {
        match slot {
            Slot::Team1 => self.team1.as_deref(),
            Slot::Team2 => self.team2.as_deref(),
        }
    }

    fn set_slot(&mut self, slot: Slot, team: String) {
        match slot {
            Slot::Team1 => self.team1 = Some(team),
            Slot::Team2 => self.team2 = Some(team),
        }
    }

    pub fn is_playing(&self, team: &str) -> bool {
        self.team1.as_deref() == Some(team) || self.team2.as_deref() == Some(team)
    }
}

/// Result of pushing a winner into the following round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Advancement {
    pub next_match: usize,
    pub slot: Slot,
}

/// Arena of matches. Arena index doubles as the persisted `match_number`:
/// round 1 occupies `0..bracket_size/2`, each later round follows in order and
/// the final is the last entry.
#[derive(Debug, Clone)]
pub struct Bracket {
    bracket_size: usize,
    rounds: u32,
    matches: Vec<MatchNode>,
}

impl Bracket {
    /// Builds the full tree for `team_count` entrants and resolves first-round byes.
    pub fn build(team_count: usize, team_ids: &[String]) -> Result<Self, BracketError> {
        if team_count < MIN_TEAMS {
            return Err(BracketError::TooFewTeams(team_count));
        }
        if team_count > MAX_TEAMS {
            return Err(BracketError::TooManyTeams(team_count));
        }

        let bracket_size = team_count.next_power_of_two();
        let rounds = bracket_size.trailing_zeros();
        let mut matches = Vec::with_capacity(bracket_size - 1);

        let mut round_start = 0;
        let mut in_round = bracket_size / 2;
        for round_number in 1..=rounds {
            let next_start = round_start + in_round;
            for position in 0..in_round {
                let next_match = (round_number < rounds).then_some(next_start + position / 2);
                matches.push(MatchNode::empty(round_number, position, next_match));
            }
            round_start = next_start;
            in_round /= 2;
        }

        let mut bracket = Self { bracket_size, rounds, matches };
        bracket.seed(seed_slots(bracket_size, team_count, team_ids));
        bracket.resolve_byes();
        Ok(bracket)
    }

    /// Rebuilds a bracket from stored matches ordered by `match_number`.
    pub fn from_matches(matches: Vec<MatchNode>) -> Result<Self, BracketError> {
        let bracket_size = matches.len() + 1;
        if matches.is_empty() || !bracket_size.is_power_of_two() {
            return Err(BracketError::Malformed(format!(
                "{} matches cannot form a single-elimination tree",
                matches.len()
            )));
        }
        let rounds = bracket_size.trailing_zeros();
        let last = matches.len() - 1;

        for (index, node) in matches.iter().enumerate() {
            match node.next_match {
                // 只允许向后链接，保证无环
                Some(next) if next <= index || next > last => {
                    return Err(BracketError::Malformed(format!(
                        "match {} links to {}",
                        index, next
                    )));
                }
                Some(next) if matches[next].round_number != node.round_number + 1 => {
                    return Err(BracketError::Malformed(format!(
                        "match {} skips a round",
                        index
                    )));
                }
                None if index != last => {
                    return Err(BracketError::Malformed(format!(
                        "match {} has no forward link but is not the final",
                        index
                    )));
                }
                _ => {}
            }
        }

        Ok(Self { bracket_size, rounds, matches })
    }

    pub fn bracket_size(&self) -> usize {
        self.bracket_size
    }

    pub fn rounds(&self) -> u32 {
        self.rounds
    }

    pub fn matches(&self) -> &[MatchNode] {
        &self.matches
    }

    #[cfg(test)]
    pub fn match_at(&self, index: usize) -> Option<&MatchNode> {
        self.matches.get(index)
    }

    #[cfg(test)]
    pub fn final_index(&self) -> usize {
        self.matches.len() - 1
    }

    pub fn round(&self, round_number: u32) -> impl Iterator<Item = (usize, &MatchNode)> {
        self.matches
            .iter()
            .enumerate()
            .filter(move |(_, m)| m.round_number == round_number)
    }

    /// Records `winner` for the match and writes it into the next match.
    ///
    /// The downstream slot is team1 when it is still empty, otherwise team2.
    /// This is not position-aware: siblings finishing out of order swap sides,
    /// and re-advancing a match writes again without clearing the old entry.
    pub fn advance(
        &mut self,
        index: usize,
        winner: &str,
    ) -> Result<Option<Advancement>, BracketError> {
        let node = self
            .matches
            .get_mut(index)
            .ok_or(BracketError::UnknownMatch(index))?;
        if !node.is_playing(winner) {
            return Err(BracketError::WinnerNotInMatch {
                index,
                winner: winner.to_string(),
            });
        }
        node.winner = Some(winner.to_string());

        let Some(next_match) = node.next_match else {
            return Ok(None);
        };
        let next = &mut self.matches[next_match];
        let slot = if next.team1.is_none() { Slot::Team1 } else { Slot::Team2 };
        next.set_slot(slot, winner.to_string());
        Ok(Some(Advancement { next_match, slot }))
    }

    fn seed(&mut self, slots: Vec<Option<String>>) {
        for (i, pair) in slots.chunks(2).enumerate() {
            let node = &mut self.matches[i];
            node.team1 = pair[0].clone();
            node.team2 = pair[1].clone();
        }
    }

    // 只在初始播种后执行一次，不会递归处理后续轮次的轮空
    fn resolve_byes(&mut self) {
        for index in 0..self.bracket_size / 2 {
            let node = &mut self.matches[index];
            let lone = match (&node.team1, &node.team2) {
                (Some(team), None) | (None, Some(team)) => team.clone(),
                _ => continue,
            };
            node.winner = Some(lone.clone());
            node.team1_score = 0;
            node.team2_score = 0;
            node.status = MatchStatus::Completed;

            if let Some(next) = node.next_match {
                let slot = Slot::fed_by(node.position);
                self.matches[next].set_slot(slot, lone);
            }
        }
    }
}

/// Lays entrants out over `bracket_size` slots, pairing `2i`/`2i+1` per
/// first-round match. Every first-round match takes one entrant before any
/// takes a second, so byes spread across the round; a full list maps
/// positionally.
pub fn seed_slots(bracket_size: usize, team_count: usize, team_ids: &[String]) -> Vec<Option<String>> {
    let entrants: Vec<Option<String>> = team_ids
        .iter()
        .take(team_count.min(bracket_size))
        .map(|id| normalize_team_id(id))
        .collect();
    let first_round = bracket_size / 2;
    let full_matches = entrants.len().saturating_sub(first_round);

    let mut slots = vec![None; bracket_size];
    let mut entrants = entrants.into_iter();
    for i in 0..first_round {
        slots[2 * i] = entrants.next().flatten();
        if i < full_matches {
            slots[2 * i + 1] = entrants.next().flatten();
        }
    }
    slots
}

pub fn normalize_team_id(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || PLACEHOLDERS.iter().any(|p| trimmed.eq_ignore_ascii_case(p)) {
        None
    } else {
        Some(trimmed.to_string())
    }
}
