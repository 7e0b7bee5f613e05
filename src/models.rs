// ====================================================================================
// src/models.rs - 数据模型定义
// ====================================================================================
use serde::{Deserialize, Serialize};

use crate::bracket::MatchStatus;
use crate::db::{BracketRow, GameRow, MatchRow, PlayerRow, ScoreboardRow, TeamRow};
use crate::heartbeat::Liveness;

// 控制端失联时写入 display_state 的降级标记
pub const TECHNICAL_DIFFICULTIES: &str = "technical";

// 推送给观众的事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BroadcastEvent {
    GameUpdate { data: GameProjection },
    BracketUpdate { data: BracketInvalidation },
    PlayerAdded { data: PlayerProjection },
    PlayerUpdated { data: PlayerProjection },
    PlayerRemoved { data: RemovedPlayer },
    ViewerCount { count: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeamBrief {
    pub id: String,
    pub name: String,
    pub color: Option<String>,
}

impl From<&TeamRow> for TeamBrief {
    fn from(team: &TeamRow) -> Self {
        Self { id: team.id.clone(), name: team.name.clone(), color: team.color.clone() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameProjection {
    pub id: String,
    pub home_score: i64,
    pub away_score: i64,
    pub status: String,
    pub quarter: Option<String>,
    pub game_time: Option<String>,
    pub display_state: Option<String>,
    pub timer_running: bool,
    pub timer_started_at: Option<i64>,
    pub timer_started_seconds: Option<i64>,
    pub home_team: TeamBrief,
    pub away_team: TeamBrief,
}

impl GameProjection {
    pub fn new(game: &GameRow, home: &TeamRow, away: &TeamRow) -> Self {
        Self {
            id: game.id.clone(),
            home_score: game.home_score,
            away_score: game.away_score,
            status: game.status.clone(),
            quarter: game.quarter.clone(),
            game_time: game.game_time.clone(),
            display_state: game.display_state.clone(),
            timer_running: game.timer_running,
            timer_started_at: game.timer_started_at,
            timer_started_seconds: game.timer_started_seconds,
            home_team: home.into(),
            away_team: away.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BracketInvalidation {
    pub match_id: String,
    pub bracket_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerProjection {
    pub id: String,
    pub name: String,
    pub score: i64,
    pub color: String,
}

impl From<&PlayerRow> for PlayerProjection {
    fn from(player: &PlayerRow) -> Self {
        Self {
            id: player.id.clone(),
            name: player.name.clone(),
            score: player.score,
            color: player.color.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemovedPlayer {
    pub id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameStatus {
    Scheduled,
    Live,
    Final,
}

impl GameStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GameStatus::Scheduled => "scheduled",
            GameStatus::Live => "live",
            GameStatus::Final => "final",
        }
    }
}

// API请求/响应模型
#[derive(Deserialize)]
pub struct CreateLeagueRequest {
    pub name: String,
    pub sport: String,
    pub season: String,
}

#[derive(Deserialize)]
pub struct CreateTeamRequest {
    pub league_id: String,
    pub name: String,
    pub abbreviation: Option<String>,
    pub color: Option<String>,
}

#[derive(Deserialize)]
pub struct CreateGameRequest {
    pub league_id: String,
    pub home_team_id: String,
    pub away_team_id: String,
    pub scheduled_at: Option<i64>,
}

#[derive(Deserialize, Default)]
pub struct GameUpdate {
    pub home_score: Option<i64>,
    pub away_score: Option<i64>,
    pub status: Option<GameStatus>,
    pub quarter: Option<String>,
    pub game_time: Option<String>,
    pub timer_running: Option<bool>,
    pub timer_seconds: Option<i64>,
    pub display_state: Option<String>,
}

#[derive(Serialize)]
pub struct GameResponse {
    #[serde(flatten)]
    pub game: GameRow,
    pub home_team: TeamRow,
    pub away_team: TeamRow,
}

#[derive(Deserialize)]
pub struct CreateBracketRequest {
    pub league_id: String,
    pub name: String,
    #[serde(default = "default_bracket_type")]
    pub bracket_type: String,
    pub num_teams: i64,
    #[serde(default)]
    pub team_ids: Vec<String>,
}

fn default_bracket_type() -> String {
    "single_elimination".to_string()
}

#[derive(Deserialize, Default)]
pub struct MatchUpdate {
    pub team1_score: Option<i64>,
    pub team2_score: Option<i64>,
    pub status: Option<MatchStatus>,
    pub winner_id: Option<String>,
}

#[derive(Serialize)]
pub struct BracketResponse {
    #[serde(flatten)]
    pub bracket: BracketRow,
    pub bracket_size: usize,
    pub rounds: u32,
    pub matches: Vec<MatchRow>,
}

#[derive(Deserialize)]
pub struct CreatePlayerRequest {
    pub name: String,
    #[serde(default)]
    pub score: i64,
    #[serde(default = "default_color")]
    pub color: String,
}

fn default_color() -> String {
    "#3B82F6".to_string()
}

#[derive(Deserialize, Default)]
pub struct PlayerUpdate {
    pub name: Option<String>,
    pub score: Option<i64>,
    pub color: Option<String>,
}

#[derive(Deserialize)]
pub struct CreateScoreboardRequest {
    pub name: String,
    pub description: Option<String>,
    #[serde(default = "default_public")]
    pub is_public: bool,
    #[serde(default)]
    pub players: Vec<CreatePlayerRequest>,
}

fn default_public() -> bool {
    true
}

#[derive(Serialize)]
pub struct ScoreboardResponse {
    #[serde(flatten)]
    pub scoreboard: ScoreboardRow,
    pub players: Vec<PlayerRow>,
}

#[derive(Serialize)]
pub struct HeartbeatStatusResponse {
    pub game_id: String,
    pub state: Liveness,
    pub degraded: bool,
}
