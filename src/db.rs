// ====================================================================================
// src/db.rs - 数据库交互
// ====================================================================================
use crate::bracket::{Bracket, BracketError, MatchNode, MatchStatus};
use crate::error::AppError;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{FromRow, SqliteConnection, SqlitePool};
use std::collections::HashMap;
use std::str::FromStr;
use uuid::Uuid;

const GAME_COLUMNS: &str = "id, league_id, home_team_id, away_team_id, home_score, away_score, status, quarter, game_time, \
    timer_running, timer_started_at, timer_started_seconds, display_state, scheduled_at, started_at, ended_at, \
    share_code, created_at, updated_at";

const MATCH_COLUMNS: &str = "id, bracket_id, round_number, match_number, team1_id, team2_id, team1_score, team2_score, \
    winner_id, status, next_match_id";

#[derive(FromRow, Serialize, Debug, Clone)]
pub struct LeagueRow {
    pub id: String,
    pub name: String,
    pub sport: String,
    pub season: String,
    pub owner_id: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(FromRow, Serialize, Debug, Clone)]
pub struct TeamRow {
    pub id: String,
    pub league_id: String,
    pub name: String,
    pub abbreviation: Option<String>,
    pub color: Option<String>,
    pub wins: i64,
    pub losses: i64,
    pub ties: i64,
    pub points_for: i64,
    pub points_against: i64,
    pub created_at: i64,
}

#[derive(FromRow, Serialize, Debug, Clone)]
pub struct GameRow {
    pub id: String,
    pub league_id: String,
    pub home_team_id: String,
    pub away_team_id: String,
    pub home_score: i64,
    pub away_score: i64,
    pub status: String,
    pub quarter: Option<String>,
    pub game_time: Option<String>,
    pub timer_running: bool,
    // 计时锚点，毫秒时间戳
    pub timer_started_at: Option<i64>,
    pub timer_started_seconds: Option<i64>,
    pub display_state: Option<String>,
    pub scheduled_at: Option<i64>,
    pub started_at: Option<i64>,
    pub ended_at: Option<i64>,
    pub share_code: String,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(FromRow, Serialize, Debug, Clone)]
pub struct BracketRow {
    pub id: String,
    pub league_id: String,
    pub name: String,
    pub bracket_type: String,
    pub num_teams: i64,
    pub share_code: String,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(FromRow, Serialize, Debug, Clone)]
pub struct MatchRow {
    pub id: String,
    pub bracket_id: String,
    pub round_number: i64,
    pub match_number: i64,
    pub team1_id: Option<String>,
    pub team2_id: Option<String>,
    pub team1_score: i64,
    pub team2_score: i64,
    pub winner_id: Option<String>,
    pub status: String,
    pub next_match_id: Option<String>,
}

#[derive(FromRow, Serialize, Debug, Clone)]
pub struct ScoreboardRow {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub share_code: String,
    pub is_public: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(FromRow, Serialize, Debug, Clone)]
pub struct PlayerRow {
    pub id: String,
    pub scoreboard_id: String,
    pub name: String,
    pub score: i64,
    pub color: String,
    pub created_at: i64,
}

pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

// 分享码：UUID 前 8 位，大写
pub fn new_share_code() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_uppercase()
}

pub async fn connect(database_url: &str) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
    // 内存数据库每个连接都是独立的库，只能使用单连接且不能被回收
    if database_url.contains(":memory:") {
        return SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await;
    }
    SqlitePoolOptions::new()
        .max_connections(10)
        .connect_with(options)
        .await
}

// 初始化数据库表
pub async fn migrate(pool: &SqlitePool) -> Result<(), AppError> {
    sqlx::query(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        CREATE TABLE IF NOT EXISTS leagues (id TEXT PRIMARY KEY, name TEXT NOT NULL, sport TEXT NOT NULL, season TEXT NOT NULL, owner_id TEXT, created_at INTEGER NOT NULL, updated_at INTEGER NOT NULL);
        CREATE TABLE IF NOT EXISTS teams (id TEXT PRIMARY KEY, league_id TEXT NOT NULL, name TEXT NOT NULL, abbreviation TEXT, color TEXT, wins INTEGER NOT NULL DEFAULT 0, losses INTEGER NOT NULL DEFAULT 0, ties INTEGER NOT NULL DEFAULT 0, points_for INTEGER NOT NULL DEFAULT 0, points_against INTEGER NOT NULL DEFAULT 0, created_at INTEGER NOT NULL);
        CREATE TABLE IF NOT EXISTS games (id TEXT PRIMARY KEY, league_id TEXT NOT NULL, home_team_id TEXT NOT NULL, away_team_id TEXT NOT NULL, home_score INTEGER NOT NULL DEFAULT 0, away_score INTEGER NOT NULL DEFAULT 0, status TEXT NOT NULL DEFAULT 'scheduled', quarter TEXT, game_time TEXT, timer_running INTEGER NOT NULL DEFAULT 0, timer_started_at INTEGER, timer_started_seconds INTEGER, display_state TEXT, scheduled_at INTEGER, started_at INTEGER, ended_at INTEGER, share_code TEXT NOT NULL UNIQUE, created_at INTEGER NOT NULL, updated_at INTEGER NOT NULL);
        CREATE TABLE IF NOT EXISTS brackets (id TEXT PRIMARY KEY, league_id TEXT NOT NULL, name TEXT NOT NULL, bracket_type TEXT NOT NULL, num_teams INTEGER NOT NULL, share_code TEXT NOT NULL UNIQUE, created_at INTEGER NOT NULL, updated_at INTEGER NOT NULL);
        CREATE TABLE IF NOT EXISTS bracket_matches (id TEXT PRIMARY KEY, bracket_id TEXT NOT NULL, round_number INTEGER NOT NULL, match_number INTEGER NOT NULL, team1_id TEXT, team2_id TEXT, team1_score INTEGER NOT NULL DEFAULT 0, team2_score INTEGER NOT NULL DEFAULT 0, winner_id TEXT, status TEXT NOT NULL DEFAULT 'pending', next_match_id TEXT);
        CREATE TABLE IF NOT EXISTS scoreboards (id TEXT PRIMARY KEY, name TEXT NOT NULL, description TEXT, share_code TEXT NOT NULL UNIQUE, is_public INTEGER NOT NULL DEFAULT 1, created_at INTEGER NOT NULL, updated_at INTEGER NOT NULL);
        CREATE TABLE IF NOT EXISTS scoreboard_players (id TEXT PRIMARY KEY, scoreboard_id TEXT NOT NULL, name TEXT NOT NULL, score INTEGER NOT NULL DEFAULT 0, color TEXT NOT NULL, created_at INTEGER NOT NULL);

        -- 添加索引以提高查询性能
        CREATE INDEX IF NOT EXISTS idx_teams_league_id ON teams(league_id);
        CREATE INDEX IF NOT EXISTS idx_games_league_id ON games(league_id);
        CREATE INDEX IF NOT EXISTS idx_bracket_matches_bracket_id ON bracket_matches(bracket_id);
        CREATE INDEX IF NOT EXISTS idx_scoreboard_players_scoreboard_id ON scoreboard_players(scoreboard_id);
        ",
    )
    .execute(pool)
    .await?;
    Ok(())
}

// ---------------------------------- 联赛与球队 ----------------------------------

pub async fn insert_league(conn: &mut SqliteConnection, league: &LeagueRow) -> Result<(), AppError> {
    sqlx::query("INSERT INTO leagues (id, name, sport, season, owner_id, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?)")
        .bind(&league.id).bind(&league.name).bind(&league.sport).bind(&league.season)
        .bind(&league.owner_id).bind(league.created_at).bind(league.updated_at)
        .execute(&mut *conn).await?;
    Ok(())
}

pub async fn get_league(conn: &mut SqliteConnection, league_id: &str) -> Result<Option<LeagueRow>, AppError> {
    sqlx::query_as("SELECT id, name, sport, season, owner_id, created_at, updated_at FROM leagues WHERE id = ?")
        .bind(league_id)
        .fetch_optional(&mut *conn).await.map_err(Into::into)
}

pub async fn insert_team(conn: &mut SqliteConnection, team: &TeamRow) -> Result<(), AppError> {
    sqlx::query("INSERT INTO teams (id, league_id, name, abbreviation, color, wins, losses, ties, points_for, points_against, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)")
        .bind(&team.id).bind(&team.league_id).bind(&team.name).bind(&team.abbreviation).bind(&team.color)
        .bind(team.wins).bind(team.losses).bind(team.ties).bind(team.points_for).bind(team.points_against)
        .bind(team.created_at)
        .execute(&mut *conn).await?;
    Ok(())
}

pub async fn get_team(conn: &mut SqliteConnection, team_id: &str) -> Result<Option<TeamRow>, AppError> {
    sqlx::query_as("SELECT id, league_id, name, abbreviation, color, wins, losses, ties, points_for, points_against, created_at FROM teams WHERE id = ?")
        .bind(team_id)
        .fetch_optional(&mut *conn).await.map_err(Into::into)
}

// 排名：胜场降序，负场升序，净胜分降序
pub async fn get_standings(conn: &mut SqliteConnection, league_id: &str) -> Result<Vec<TeamRow>, AppError> {
    sqlx::query_as(
        "SELECT id, league_id, name, abbreviation, color, wins, losses, ties, points_for, points_against, created_at FROM teams \
         WHERE league_id = ? ORDER BY wins DESC, losses ASC, (points_for - points_against) DESC",
    )
    .bind(league_id)
    .fetch_all(&mut *conn).await.map_err(Into::into)
}

// 结算比分到双方球队战绩（后写覆盖，不做并发控制）
pub async fn record_final_score(conn: &mut SqliteConnection, game: &GameRow) -> Result<(), AppError> {
    let (home_result, away_result) = match game.home_score.cmp(&game.away_score) {
        std::cmp::Ordering::Greater => ("wins", "losses"),
        std::cmp::Ordering::Less => ("losses", "wins"),
        std::cmp::Ordering::Equal => ("ties", "ties"),
    };
    for (team_id, result, scored, conceded) in [
        (&game.home_team_id, home_result, game.home_score, game.away_score),
        (&game.away_team_id, away_result, game.away_score, game.home_score),
    ] {
        let sql = format!(
            "UPDATE teams SET {result} = {result} + 1, points_for = points_for + ?, points_against = points_against + ? WHERE id = ?"
        );
        sqlx::query(&sql)
            .bind(scored).bind(conceded).bind(team_id)
            .execute(&mut *conn).await?;
    }
    Ok(())
}

// ---------------------------------- 比赛 ----------------------------------

pub async fn insert_game(conn: &mut SqliteConnection, game: &GameRow) -> Result<(), AppError> {
    let sql = format!("INSERT INTO games ({GAME_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)");
    sqlx::query(&sql)
        .bind(&game.id).bind(&game.league_id).bind(&game.home_team_id).bind(&game.away_team_id)
        .bind(game.home_score).bind(game.away_score).bind(&game.status).bind(&game.quarter).bind(&game.game_time)
        .bind(game.timer_running).bind(game.timer_started_at).bind(game.timer_started_seconds).bind(&game.display_state)
        .bind(game.scheduled_at).bind(game.started_at).bind(game.ended_at)
        .bind(&game.share_code).bind(game.created_at).bind(game.updated_at)
        .execute(&mut *conn).await?;
    Ok(())
}

pub async fn get_game(conn: &mut SqliteConnection, game_id: &str) -> Result<Option<GameRow>, AppError> {
    let sql = format!("SELECT {GAME_COLUMNS} FROM games WHERE id = ?");
    sqlx::query_as(&sql).bind(game_id).fetch_optional(&mut *conn).await.map_err(Into::into)
}

pub async fn get_game_by_share_code(conn: &mut SqliteConnection, share_code: &str) -> Result<Option<GameRow>, AppError> {
    let sql = format!("SELECT {GAME_COLUMNS} FROM games WHERE share_code = ?");
    sqlx::query_as(&sql)
        .bind(share_code.to_uppercase())
        .fetch_optional(&mut *conn).await.map_err(Into::into)
}

pub async fn save_game(conn: &mut SqliteConnection, game: &GameRow) -> Result<(), AppError> {
    sqlx::query(
        "UPDATE games SET home_score = ?, away_score = ?, status = ?, quarter = ?, game_time = ?, timer_running = ?, \
         timer_started_at = ?, timer_started_seconds = ?, display_state = ?, started_at = ?, ended_at = ?, updated_at = ? WHERE id = ?",
    )
    .bind(game.home_score).bind(game.away_score).bind(&game.status).bind(&game.quarter).bind(&game.game_time)
    .bind(game.timer_running).bind(game.timer_started_at).bind(game.timer_started_seconds).bind(&game.display_state)
    .bind(game.started_at).bind(game.ended_at).bind(game.updated_at).bind(&game.id)
    .execute(&mut *conn).await?;
    Ok(())
}

// ---------------------------------- 淘汰赛 ----------------------------------

// 写入对阵树；arena 下标即 match_number
pub async fn insert_bracket(
    conn: &mut SqliteConnection,
    bracket_row: &BracketRow,
    bracket: &Bracket,
) -> Result<Vec<MatchRow>, AppError> {
    sqlx::query("INSERT INTO brackets (id, league_id, name, bracket_type, num_teams, share_code, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?)")
        .bind(&bracket_row.id).bind(&bracket_row.league_id).bind(&bracket_row.name).bind(&bracket_row.bracket_type)
        .bind(bracket_row.num_teams).bind(&bracket_row.share_code).bind(bracket_row.created_at).bind(bracket_row.updated_at)
        .execute(&mut *conn).await?;

    let ids: Vec<String> = bracket.matches().iter().map(|_| new_id()).collect();
    let mut rows = Vec::with_capacity(ids.len());
    for (index, node) in bracket.matches().iter().enumerate() {
        let row = MatchRow {
            id: ids[index].clone(),
            bracket_id: bracket_row.id.clone(),
            round_number: i64::from(node.round_number),
            match_number: index as i64,
            team1_id: node.team1.clone(),
            team2_id: node.team2.clone(),
            team1_score: node.team1_score,
            team2_score: node.team2_score,
            winner_id: node.winner.clone(),
            status: node.status.as_str().to_string(),
            next_match_id: node.next_match.map(|next| ids[next].clone()),
        };
        let sql = format!("INSERT INTO bracket_matches ({MATCH_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)");
        sqlx::query(&sql)
            .bind(&row.id).bind(&row.bracket_id).bind(row.round_number).bind(row.match_number)
            .bind(&row.team1_id).bind(&row.team2_id).bind(row.team1_score).bind(row.team2_score)
            .bind(&row.winner_id).bind(&row.status).bind(&row.next_match_id)
            .execute(&mut *conn).await?;
        rows.push(row);
    }
    Ok(rows)
}

pub async fn get_bracket(conn: &mut SqliteConnection, bracket_id: &str) -> Result<Option<BracketRow>, AppError> {
    sqlx::query_as("SELECT id, league_id, name, bracket_type, num_teams, share_code, created_at, updated_at FROM brackets WHERE id = ?")
        .bind(bracket_id)
        .fetch_optional(&mut *conn).await.map_err(Into::into)
}

pub async fn get_bracket_by_share_code(conn: &mut SqliteConnection, share_code: &str) -> Result<Option<BracketRow>, AppError> {
    sqlx::query_as("SELECT id, league_id, name, bracket_type, num_teams, share_code, created_at, updated_at FROM brackets WHERE share_code = ?")
        .bind(share_code.to_uppercase())
        .fetch_optional(&mut *conn).await.map_err(Into::into)
}

pub async fn get_bracket_matches(conn: &mut SqliteConnection, bracket_id: &str) -> Result<Vec<MatchRow>, AppError> {
    let sql = format!("SELECT {MATCH_COLUMNS} FROM bracket_matches WHERE bracket_id = ? ORDER BY match_number");
    sqlx::query_as(&sql).bind(bracket_id).fetch_all(&mut *conn).await.map_err(Into::into)
}

pub async fn get_match(conn: &mut SqliteConnection, match_id: &str) -> Result<Option<MatchRow>, AppError> {
    let sql = format!("SELECT {MATCH_COLUMNS} FROM bracket_matches WHERE id = ?");
    sqlx::query_as(&sql).bind(match_id).fetch_optional(&mut *conn).await.map_err(Into::into)
}

pub async fn save_match(conn: &mut SqliteConnection, row: &MatchRow) -> Result<(), AppError> {
    sqlx::query(
        "UPDATE bracket_matches SET team1_id = ?, team2_id = ?, team1_score = ?, team2_score = ?, winner_id = ?, status = ? WHERE id = ?",
    )
    .bind(&row.team1_id).bind(&row.team2_id).bind(row.team1_score).bind(row.team2_score)
    .bind(&row.winner_id).bind(&row.status).bind(&row.id)
    .execute(&mut *conn).await?;
    Ok(())
}

// 把存储的比赛行还原成 arena，前向链接由 id 转为下标
pub fn rows_to_bracket(rows: &[MatchRow]) -> Result<Bracket, BracketError> {
    let index_of: HashMap<&str, usize> = rows.iter().enumerate().map(|(i, r)| (r.id.as_str(), i)).collect();
    let mut nodes = Vec::with_capacity(rows.len());
    let mut positions = HashMap::<i64, usize>::new();

    for (index, row) in rows.iter().enumerate() {
        if row.match_number != index as i64 {
            return Err(BracketError::Malformed(format!("match_number {} stored at {}", row.match_number, index)));
        }
        let next_match = match &row.next_match_id {
            Some(id) => Some(
                *index_of
                    .get(id.as_str())
                    .ok_or_else(|| BracketError::Malformed(format!("dangling forward link {}", id)))?,
            ),
            None => None,
        };
        let status = MatchStatus::from_str(&row.status).map_err(BracketError::Malformed)?;
        let round_number = u32::try_from(row.round_number)
            .map_err(|_| BracketError::Malformed(format!("round {}", row.round_number)))?;
        let position = positions.entry(row.round_number).or_insert(0);

        nodes.push(MatchNode {
            round_number,
            position: *position,
            team1: row.team1_id.clone(),
            team2: row.team2_id.clone(),
            team1_score: row.team1_score,
            team2_score: row.team2_score,
            winner: row.winner_id.clone(),
            status,
            next_match,
        });
        *position += 1;
    }
    Bracket::from_matches(nodes)
}

// ---------------------------------- 记分板 ----------------------------------

pub async fn insert_scoreboard(conn: &mut SqliteConnection, scoreboard: &ScoreboardRow) -> Result<(), AppError> {
    sqlx::query("INSERT INTO scoreboards (id, name, description, share_code, is_public, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?)")
        .bind(&scoreboard.id).bind(&scoreboard.name).bind(&scoreboard.description).bind(&scoreboard.share_code)
        .bind(scoreboard.is_public).bind(scoreboard.created_at).bind(scoreboard.updated_at)
        .execute(&mut *conn).await?;
    Ok(())
}

pub async fn get_scoreboard(conn: &mut SqliteConnection, scoreboard_id: &str) -> Result<Option<ScoreboardRow>, AppError> {
    sqlx::query_as("SELECT id, name, description, share_code, is_public, created_at, updated_at FROM scoreboards WHERE id = ?")
        .bind(scoreboard_id)
        .fetch_optional(&mut *conn).await.map_err(Into::into)
}

pub async fn get_scoreboard_by_share_code(conn: &mut SqliteConnection, share_code: &str) -> Result<Option<ScoreboardRow>, AppError> {
    sqlx::query_as("SELECT id, name, description, share_code, is_public, created_at, updated_at FROM scoreboards WHERE share_code = ?")
        .bind(share_code.to_uppercase())
        .fetch_optional(&mut *conn).await.map_err(Into::into)
}

pub async fn insert_player(conn: &mut SqliteConnection, player: &PlayerRow) -> Result<(), AppError> {
    sqlx::query("INSERT INTO scoreboard_players (id, scoreboard_id, name, score, color, created_at) VALUES (?, ?, ?, ?, ?, ?)")
        .bind(&player.id).bind(&player.scoreboard_id).bind(&player.name).bind(player.score)
        .bind(&player.color).bind(player.created_at)
        .execute(&mut *conn).await?;
    Ok(())
}

pub async fn get_player(conn: &mut SqliteConnection, player_id: &str) -> Result<Option<PlayerRow>, AppError> {
    sqlx::query_as("SELECT id, scoreboard_id, name, score, color, created_at FROM scoreboard_players WHERE id = ?")
        .bind(player_id)
        .fetch_optional(&mut *conn).await.map_err(Into::into)
}

pub async fn get_players(conn: &mut SqliteConnection, scoreboard_id: &str) -> Result<Vec<PlayerRow>, AppError> {
    sqlx::query_as("SELECT id, scoreboard_id, name, score, color, created_at FROM scoreboard_players WHERE scoreboard_id = ? ORDER BY created_at, id")
        .bind(scoreboard_id)
        .fetch_all(&mut *conn).await.map_err(Into::into)
}

pub async fn save_player(conn: &mut SqliteConnection, player: &PlayerRow) -> Result<(), AppError> {
    sqlx::query("UPDATE scoreboard_players SET name = ?, score = ?, color = ? WHERE id = ?")
        .bind(&player.name).bind(player.score).bind(&player.color).bind(&player.id)
        .execute(&mut *conn).await?;
    Ok(())
}

pub async fn delete_player(conn: &mut SqliteConnection, player_id: &str) -> Result<(), AppError> {
    sqlx::query("DELETE FROM scoreboard_players WHERE id = ?")
        .bind(player_id)
        .execute(&mut *conn).await?;
    Ok(())
}
