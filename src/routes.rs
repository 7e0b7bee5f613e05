// ====================================================================================
// src/routes.rs - HTTP路由处理
// ====================================================================================
use crate::{
    auth,
    bracket::{normalize_team_id, Bracket, MatchStatus},
    db,
    db::{GameRow, LeagueRow, MatchRow, PlayerRow, ScoreboardRow, TeamRow},
    error::AppError,
    handler,
    hub::{RoomKey, RoomKind},
    models::{
        BracketInvalidation, BracketResponse, BroadcastEvent, CreateBracketRequest, CreateGameRequest,
        CreateLeagueRequest, CreatePlayerRequest, CreateScoreboardRequest, CreateTeamRequest, GameProjection,
        GameResponse, GameStatus, GameUpdate, HeartbeatStatusResponse, MatchUpdate, PlayerUpdate, RemovedPlayer,
        ScoreboardResponse, TECHNICAL_DIFFICULTIES,
    },
    state::AppState,
};
use axum::{
    extract::{Path, State, WebSocketUpgrade},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use chrono::Utc;
use headers::HeaderMapExt;
use http::HeaderMap;
use sqlx::{Sqlite, SqliteConnection, Transaction};
use std::str::FromStr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

pub fn build_router(state: Arc<AppState>) -> Router {
    // 定义CORS策略
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(health_check))
        .route("/api/leagues", post(create_league))
        .route("/api/leagues/:league_id/standings", get(get_standings))
        .route("/api/teams", post(create_team))
        .route("/api/games", post(create_game))
        .route("/api/games/share/:share_code", get(get_game_by_share_code))
        .route("/api/games/:game_id", get(get_game).put(update_game))
        .route("/api/games/:game_id/heartbeat", post(record_heartbeat).delete(stop_heartbeat))
        .route("/api/games/:game_id/heartbeat/check", get(check_heartbeat))
        .route("/api/brackets", post(create_bracket))
        .route("/api/brackets/share/:share_code", get(get_bracket_by_share_code))
        .route("/api/brackets/matches/:match_id", put(update_match))
        .route("/api/brackets/:bracket_id", get(get_bracket))
        .route("/api/scoreboards", post(create_scoreboard))
        .route("/api/scoreboards/share/:share_code", get(get_scoreboard_by_share_code))
        .route("/api/scoreboards/:scoreboard_id/players", post(add_player))
        .route("/api/scoreboards/players/:player_id", put(update_player).delete(remove_player))
        .route("/ws/:kind/:share_code", get(ws_handler))
        .with_state(state)
        .layer(cors)
}

// 健康检查
pub async fn health_check() -> impl IntoResponse {
    "OK"
}

// WebSocket处理器
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path((kind, share_code)): Path<(String, String)>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, AppError> {
    let kind = RoomKind::from_str(&kind).map_err(AppError::NotFound)?;

    // 负载保护检查
    if state.total_connections.load(Ordering::Relaxed) >= state.config.max_connections {
        return Err(AppError::ServiceUnavailable("服务器连接数已达上限".to_string()));
    }

    // 检查分享码对应的资源是否存在
    let exists = {
        let mut conn = state.db_pool.acquire().await?;
        match kind {
            RoomKind::Game => db::get_game_by_share_code(&mut conn, &share_code).await?.is_some(),
            RoomKind::Bracket => db::get_bracket_by_share_code(&mut conn, &share_code).await?.is_some(),
            RoomKind::Scoreboard => db::get_scoreboard_by_share_code(&mut conn, &share_code).await?.is_some(),
        }
    };
    if !exists {
        return Err(AppError::NotFound(format!("No {} with share code {}", kind.as_str(), share_code)));
    }

    let room = RoomKey::new(kind, &share_code);
    let user_agent = headers
        .typed_get::<headers::UserAgent>()
        .map(|ua| ua.as_str().to_string())
        .unwrap_or_default();
    tracing::debug!(room = %room, user_agent, "Upgrading viewer connection");

    // 升级连接
    Ok(ws.on_upgrade(move |socket| handler::handle_socket(socket, state, room)))
}

// ---------------------------------- 联赛与球队 ----------------------------------

// 校验联赛存在且当前操作者有权修改
async fn authorize_league(
    conn: &mut SqliteConnection,
    league_id: &str,
    headers: &HeaderMap,
) -> Result<LeagueRow, AppError> {
    let league = db::get_league(conn, league_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("League {} not found", league_id)))?;
    let actor = auth::current_actor(headers);
    auth::ensure_owner(league.owner_id.as_deref(), actor.as_deref())?;
    Ok(league)
}

fn require_name(name: &str) -> Result<String, AppError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(AppError::BadRequest("name must not be empty".to_string()));
    }
    Ok(name.to_string())
}

pub async fn create_league(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<CreateLeagueRequest>,
) -> Result<(StatusCode, Json<LeagueRow>), AppError> {
    let now = Utc::now().timestamp();
    let league = LeagueRow {
        id: db::new_id(),
        name: require_name(&payload.name)?,
        sport: payload.sport,
        season: payload.season,
        owner_id: auth::current_actor(&headers),
        created_at: now,
        updated_at: now,
    };
    let mut conn = state.db_pool.acquire().await?;
    db::insert_league(&mut conn, &league).await?;
    tracing::info!(league_id = %league.id, owner = ?league.owner_id, "League created");
    Ok((StatusCode::CREATED, Json(league)))
}

pub async fn create_team(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<CreateTeamRequest>,
) -> Result<(StatusCode, Json<TeamRow>), AppError> {
    let mut conn = state.db_pool.acquire().await?;
    authorize_league(&mut conn, &payload.league_id, &headers).await?;

    let team = TeamRow {
        id: db::new_id(),
        league_id: payload.league_id,
        name: require_name(&payload.name)?,
        abbreviation: payload.abbreviation,
        color: payload.color,
        wins: 0,
        losses: 0,
        ties: 0,
        points_for: 0,
        points_against: 0,
        created_at: Utc::now().timestamp(),
    };
    db::insert_team(&mut conn, &team).await?;
    Ok((StatusCode::CREATED, Json(team)))
}

pub async fn get_standings(
    State(state): State<Arc<AppState>>,
    Path(league_id): Path<String>,
) -> Result<Json<Vec<TeamRow>>, AppError> {
    let mut conn = state.db_pool.acquire().await?;
    if db::get_league(&mut conn, &league_id).await?.is_none() {
        return Err(AppError::NotFound(format!("League {} not found", league_id)));
    }
    Ok(Json(db::get_standings(&mut conn, &league_id).await?))
}

// ---------------------------------- 比赛 ----------------------------------

async fn league_team(conn: &mut SqliteConnection, league_id: &str, team_id: &str) -> Result<TeamRow, AppError> {
    let team = db::get_team(conn, team_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Team {} not found", team_id)))?;
    if team.league_id != league_id {
        return Err(AppError::BadRequest(format!("Team {} is not in league {}", team_id, league_id)));
    }
    Ok(team)
}

async fn game_response(conn: &mut SqliteConnection, game: GameRow) -> Result<GameResponse, AppError> {
    let home_team = league_team(conn, &game.league_id, &game.home_team_id).await?;
    let away_team = league_team(conn, &game.league_id, &game.away_team_id).await?;
    Ok(GameResponse { game, home_team, away_team })
}

fn game_room(game: &GameRow) -> RoomKey {
    RoomKey::new(RoomKind::Game, &game.share_code)
}

fn game_event(response: &GameResponse) -> BroadcastEvent {
    BroadcastEvent::GameUpdate {
        data: GameProjection::new(&response.game, &response.home_team, &response.away_team),
    }
}

pub async fn create_game(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<CreateGameRequest>,
) -> Result<(StatusCode, Json<GameResponse>), AppError> {
    if payload.home_team_id == payload.away_team_id {
        return Err(AppError::BadRequest("A team cannot play itself".to_string()));
    }
    let mut conn = state.db_pool.acquire().await?;
    authorize_league(&mut conn, &payload.league_id, &headers).await?;

    let now = Utc::now().timestamp();
    let game = GameRow {
        id: db::new_id(),
        league_id: payload.league_id,
        home_team_id: payload.home_team_id,
        away_team_id: payload.away_team_id,
        home_score: 0,
        away_score: 0,
        status: GameStatus::Scheduled.as_str().to_string(),
        quarter: None,
        game_time: None,
        timer_running: false,
        timer_started_at: None,
        timer_started_seconds: None,
        display_state: None,
        scheduled_at: payload.scheduled_at,
        started_at: None,
        ended_at: None,
        share_code: db::new_share_code(),
        created_at: now,
        updated_at: now,
    };
    let response = game_response(&mut conn, game).await?;
    db::insert_game(&mut conn, &response.game).await?;
    tracing::info!(game_id = %response.game.id, share_code = %response.game.share_code, "Game created");
    Ok((StatusCode::CREATED, Json(response)))
}

// 读取时投影计时器；归零时写回停止状态
async fn read_game(conn: &mut SqliteConnection, mut game: GameRow) -> Result<GameResponse, AppError> {
    if handler::settle_clock(&mut game, Utc::now()) {
        db::save_game(conn, &game).await?;
        tracing::debug!(game_id = %game.id, "Game clock expired");
    }
    game_response(conn, game).await
}

pub async fn get_game(
    State(state): State<Arc<AppState>>,
    Path(game_id): Path<String>,
) -> Result<Json<GameResponse>, AppError> {
    let mut conn = state.db_pool.acquire().await?;
    let game = db::get_game(&mut conn, &game_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Game {} not found", game_id)))?;
    Ok(Json(read_game(&mut conn, game).await?))
}

pub async fn get_game_by_share_code(
    State(state): State<Arc<AppState>>,
    Path(share_code): Path<String>,
) -> Result<Json<GameResponse>, AppError> {
    let mut conn = state.db_pool.acquire().await?;
    let game = db::get_game_by_share_code(&mut conn, &share_code)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Game with share code {} not found", share_code)))?;
    Ok(Json(read_game(&mut conn, game).await?))
}

pub async fn update_game(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(game_id): Path<String>,
    Json(payload): Json<GameUpdate>,
) -> Result<Json<GameResponse>, AppError> {
    let mut tx = state.db_pool.begin().await?;
    let mut game = db::get_game(&mut tx, &game_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Game {} not found", game_id)))?;
    authorize_league(&mut tx, &game.league_id, &headers).await?;

    let transition = handler::apply_game_update(&mut game, payload, Utc::now())?;
    db::save_game(&mut tx, &game).await?;
    if transition.became_final {
        db::record_final_score(&mut tx, &game).await?;
    }
    let response = game_response(&mut tx, game).await?;
    tx.commit().await?;

    if transition.became_final {
        tracing::info!(game_id = %response.game.id, "Game final, standings updated");
    }
    state.hub.publish(&game_room(&response.game), game_event(&response)).await;
    Ok(Json(response))
}

// ---------------------------------- 心跳 ----------------------------------

pub async fn record_heartbeat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(game_id): Path<String>,
) -> Result<StatusCode, AppError> {
    {
        let mut conn = state.db_pool.acquire().await?;
        let game = db::get_game(&mut conn, &game_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Game {} not found", game_id)))?;
        authorize_league(&mut conn, &game.league_id, &headers).await?;
    }
    state.heartbeats.beat(&game_id).await;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn check_heartbeat(
    State(state): State<Arc<AppState>>,
    Path(game_id): Path<String>,
) -> Result<Json<HeartbeatStatusResponse>, AppError> {
    let mut tx = state.db_pool.begin().await?;
    let mut game = db::get_game(&mut tx, &game_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Game {} not found", game_id)))?;

    let check = state.heartbeats.check(&game_id).await;
    if !(check.newly_inactive && game.status == GameStatus::Live.as_str()) {
        tx.commit().await?;
    } else {
        match degrade_game(tx, &mut game).await {
            Ok(event) => {
                tracing::warn!(game_id = %game.id, "Controller lost, showing technical difficulties");
                state.hub.publish(&game_room(&game), event).await;
            }
            Err(e) => {
                // 未能落库，下次检查需要重新触发
                state.heartbeats.rearm(&game_id).await;
                return Err(e);
            }
        }
    }

    Ok(Json(HeartbeatStatusResponse {
        game_id: game.id,
        state: check.liveness,
        degraded: game.display_state.as_deref() == Some(TECHNICAL_DIFFICULTIES),
    }))
}

async fn degrade_game(mut tx: Transaction<'static, Sqlite>, game: &mut GameRow) -> Result<BroadcastEvent, AppError> {
    game.display_state = Some(TECHNICAL_DIFFICULTIES.to_string());
    game.updated_at = Utc::now().timestamp();
    db::save_game(&mut tx, game).await?;
    let response = game_response(&mut tx, game.clone()).await?;
    tx.commit().await?;
    Ok(game_event(&response))
}

pub async fn stop_heartbeat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(game_id): Path<String>,
) -> Result<StatusCode, AppError> {
    {
        let mut conn = state.db_pool.acquire().await?;
        let game = db::get_game(&mut conn, &game_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Game {} not found", game_id)))?;
        authorize_league(&mut conn, &game.league_id, &headers).await?;
    }
    state.heartbeats.stop(&game_id).await;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------- 淘汰赛 ----------------------------------

fn bracket_response(bracket: db::BracketRow, matches: Vec<MatchRow>) -> Result<BracketResponse, AppError> {
    let tree = db::rows_to_bracket(&matches).map_err(|e| {
        tracing::error!(bracket_id = %bracket.id, "Stored bracket is broken: {}", e);
        AppError::InternalServerError(e.to_string())
    })?;
    Ok(BracketResponse {
        bracket,
        bracket_size: tree.bracket_size(),
        rounds: tree.rounds(),
        matches,
    })
}

pub async fn create_bracket(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<CreateBracketRequest>,
) -> Result<(StatusCode, Json<BracketResponse>), AppError> {
    if payload.bracket_type != "single_elimination" {
        return Err(AppError::BadRequest(format!("Unsupported bracket type {}", payload.bracket_type)));
    }
    let team_count = usize::try_from(payload.num_teams).unwrap_or(0);
    let tree = Bracket::build(team_count, &payload.team_ids)?;

    let mut tx = state.db_pool.begin().await?;
    authorize_league(&mut tx, &payload.league_id, &headers).await?;
    for team_id in payload.team_ids.iter().filter_map(|raw| normalize_team_id(raw)) {
        league_team(&mut tx, &payload.league_id, &team_id).await?;
    }

    let now = Utc::now().timestamp();
    let bracket = db::BracketRow {
        id: db::new_id(),
        league_id: payload.league_id,
        name: require_name(&payload.name)?,
        bracket_type: payload.bracket_type,
        num_teams: payload.num_teams,
        share_code: db::new_share_code(),
        created_at: now,
        updated_at: now,
    };
    let matches = db::insert_bracket(&mut tx, &bracket, &tree).await?;
    tx.commit().await?;

    tracing::info!(
        bracket_id = %bracket.id,
        bracket_size = tree.bracket_size(),
        rounds = tree.rounds(),
        byes = tree.round(1).filter(|(_, m)| m.status == MatchStatus::Completed).count(),
        "Bracket created"
    );
    Ok((StatusCode::CREATED, Json(bracket_response(bracket, matches)?)))
}

pub async fn get_bracket(
    State(state): State<Arc<AppState>>,
    Path(bracket_id): Path<String>,
) -> Result<Json<BracketResponse>, AppError> {
    let mut conn = state.db_pool.acquire().await?;
    let bracket = db::get_bracket(&mut conn, &bracket_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Bracket {} not found", bracket_id)))?;
    let matches = db::get_bracket_matches(&mut conn, &bracket.id).await?;
    Ok(Json(bracket_response(bracket, matches)?))
}

pub async fn get_bracket_by_share_code(
    State(state): State<Arc<AppState>>,
    Path(share_code): Path<String>,
) -> Result<Json<BracketResponse>, AppError> {
    let mut conn = state.db_pool.acquire().await?;
    let bracket = db::get_bracket_by_share_code(&mut conn, &share_code)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Bracket with share code {} not found", share_code)))?;
    let matches = db::get_bracket_matches(&mut conn, &bracket.id).await?;
    Ok(Json(bracket_response(bracket, matches)?))
}

pub async fn update_match(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(match_id): Path<String>,
    Json(payload): Json<MatchUpdate>,
) -> Result<Json<MatchRow>, AppError> {
    let mut tx = state.db_pool.begin().await?;
    let row = db::get_match(&mut tx, &match_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Match {} not found", match_id)))?;
    let bracket = db::get_bracket(&mut tx, &row.bracket_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Bracket {} not found", row.bracket_id)))?;
    authorize_league(&mut tx, &bracket.league_id, &headers).await?;

    let mut rows = db::get_bracket_matches(&mut tx, &bracket.id).await?;
    let mut tree = db::rows_to_bracket(&rows).map_err(|e| AppError::InternalServerError(e.to_string()))?;
    let index = rows
        .iter()
        .position(|r| r.id == match_id)
        .ok_or_else(|| AppError::NotFound(format!("Match {} not found", match_id)))?;

    let changed = handler::apply_match_update(&mut tree, &mut rows, index, payload)?;
    for i in &changed {
        db::save_match(&mut tx, &rows[*i]).await?;
    }
    tx.commit().await?;

    let room = RoomKey::new(RoomKind::Bracket, &bracket.share_code);
    let event = BroadcastEvent::BracketUpdate {
        data: BracketInvalidation { match_id: match_id.clone(), bracket_id: bracket.id.clone() },
    };
    state.hub.publish(&room, event).await;
    Ok(Json(rows.swap_remove(index)))
}

// ---------------------------------- 记分板 ----------------------------------

fn new_player(scoreboard_id: &str, payload: CreatePlayerRequest, created_at: i64) -> Result<PlayerRow, AppError> {
    Ok(PlayerRow {
        id: db::new_id(),
        scoreboard_id: scoreboard_id.to_string(),
        name: require_name(&payload.name)?,
        score: payload.score,
        color: payload.color,
        created_at,
    })
}

pub async fn create_scoreboard(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateScoreboardRequest>,
) -> Result<(StatusCode, Json<ScoreboardResponse>), AppError> {
    let now = Utc::now().timestamp();
    let scoreboard = ScoreboardRow {
        id: db::new_id(),
        name: require_name(&payload.name)?,
        description: payload.description,
        share_code: db::new_share_code(),
        is_public: payload.is_public,
        created_at: now,
        updated_at: now,
    };
    let players = payload
        .players
        .into_iter()
        .map(|p| new_player(&scoreboard.id, p, now))
        .collect::<Result<Vec<_>, _>>()?;

    let mut tx = state.db_pool.begin().await?;
    db::insert_scoreboard(&mut tx, &scoreboard).await?;
    for player in &players {
        db::insert_player(&mut tx, player).await?;
    }
    tx.commit().await?;
    Ok((StatusCode::CREATED, Json(ScoreboardResponse { scoreboard, players })))
}

pub async fn get_scoreboard_by_share_code(
    State(state): State<Arc<AppState>>,
    Path(share_code): Path<String>,
) -> Result<Json<ScoreboardResponse>, AppError> {
    let mut conn = state.db_pool.acquire().await?;
    let scoreboard = db::get_scoreboard_by_share_code(&mut conn, &share_code)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Scoreboard with share code {} not found", share_code)))?;
    let players = db::get_players(&mut conn, &scoreboard.id).await?;
    Ok(Json(ScoreboardResponse { scoreboard, players }))
}

async fn player_scoreboard(conn: &mut SqliteConnection, player_id: &str) -> Result<(PlayerRow, ScoreboardRow), AppError> {
    let player = db::get_player(conn, player_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Player {} not found", player_id)))?;
    let scoreboard = db::get_scoreboard(conn, &player.scoreboard_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Scoreboard {} not found", player.scoreboard_id)))?;
    Ok((player, scoreboard))
}

fn scoreboard_room(scoreboard: &ScoreboardRow) -> RoomKey {
    RoomKey::new(RoomKind::Scoreboard, &scoreboard.share_code)
}

pub async fn add_player(
    State(state): State<Arc<AppState>>,
    Path(scoreboard_id): Path<String>,
    Json(payload): Json<CreatePlayerRequest>,
) -> Result<(StatusCode, Json<PlayerRow>), AppError> {
    let (player, scoreboard) = {
        let mut conn = state.db_pool.acquire().await?;
        let scoreboard = db::get_scoreboard(&mut conn, &scoreboard_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Scoreboard {} not found", scoreboard_id)))?;
        let player = new_player(&scoreboard.id, payload, Utc::now().timestamp())?;
        db::insert_player(&mut conn, &player).await?;
        (player, scoreboard)
    };

    let event = BroadcastEvent::PlayerAdded { data: (&player).into() };
    state.hub.publish(&scoreboard_room(&scoreboard), event).await;
    Ok((StatusCode::CREATED, Json(player)))
}

pub async fn update_player(
    State(state): State<Arc<AppState>>,
    Path(player_id): Path<String>,
    Json(payload): Json<PlayerUpdate>,
) -> Result<Json<PlayerRow>, AppError> {
    let (player, scoreboard) = {
        let mut conn = state.db_pool.acquire().await?;
        let (mut player, scoreboard) = player_scoreboard(&mut conn, &player_id).await?;
        if let Some(name) = payload.name {
            player.name = require_name(&name)?;
        }
        if let Some(score) = payload.score {
            player.score = score;
        }
        if let Some(color) = payload.color {
            player.color = color;
        }
        db::save_player(&mut conn, &player).await?;
        (player, scoreboard)
    };

    let event = BroadcastEvent::PlayerUpdated { data: (&player).into() };
    state.hub.publish(&scoreboard_room(&scoreboard), event).await;
    Ok(Json(player))
}

pub async fn remove_player(
    State(state): State<Arc<AppState>>,
    Path(player_id): Path<String>,
) -> Result<StatusCode, AppError> {
    let scoreboard = {
        let mut conn = state.db_pool.acquire().await?;
        let (player, scoreboard) = player_scoreboard(&mut conn, &player_id).await?;
        db::delete_player(&mut conn, &player.id).await?;
        scoreboard
    };

    let event = BroadcastEvent::PlayerRemoved { data: RemovedPlayer { id: player_id } };
    state.hub.publish(&scoreboard_room(&scoreboard), event).await;
    Ok(StatusCode::NO_CONTENT)
}
