// ====================================================================================
// src/handler.rs - 核心业务逻辑处理器
// ====================================================================================
use crate::{
    bracket::{Bracket, MatchStatus, Slot},
    clock::{self, ClockReading},
    db::{GameRow, MatchRow},
    error::AppError,
    hub::RoomKey,
    models::{GameStatus, GameUpdate, MatchUpdate},
    state::AppState,
};
use axum::extract::ws::{Message, WebSocket};
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

// RAII Guard for connection counting
struct ConnectionGuard {
    count: Arc<AtomicU32>,
}

impl ConnectionGuard {
    fn new(count: Arc<AtomicU32>) -> Self {
        count.fetch_add(1, Ordering::Relaxed);
        Self { count }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::Relaxed);
    }
}

// 处理单个观众的WebSocket连接
pub async fn handle_socket(socket: WebSocket, state: Arc<AppState>, room: RoomKey) {
    let _conn_guard = ConnectionGuard::new(state.total_connections.clone());
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (viewer_id, mut rx) = state.hub.subscribe(&room).await;
    tracing::info!(room = %room, %viewer_id, "Viewer connected");

    // 队列被广播中心关闭（连接被淘汰）时结束并关闭socket
    let mut forwarder = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(e) => {
                    tracing::error!("Failed to encode broadcast event: {}", e);
                    continue;
                }
            };
            if ws_sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    // 观众端只读，客户端消息直接丢弃
    loop {
        tokio::select! {
            _ = &mut forwarder => break,
            msg = ws_receiver.next() => match msg {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    forwarder.abort();
    state.hub.leave(&room, viewer_id).await;
    tracing::info!(room = %room, %viewer_id, "Viewer disconnected");
}

// ---------------------------------- 比赛 ----------------------------------

#[derive(Debug, Default, PartialEq, Eq)]
pub struct GameTransition {
    pub became_final: bool,
}

pub fn project_game_clock(game: &GameRow, now: DateTime<Utc>) -> ClockReading {
    let previous = ClockReading {
        display: game.game_time.clone().unwrap_or_default(),
        running: game.timer_running,
    };
    if !game.timer_running {
        return previous;
    }
    let (Some(started_at), Some(seconds)) = (game.timer_started_at, game.timer_started_seconds) else {
        return previous;
    };
    let Some(anchor) = DateTime::from_timestamp_millis(started_at) else {
        return previous;
    };
    clock::project(anchor, seconds, now, previous)
}

/// Folds the live projection into `game` for a read. Returns true when the
/// countdown reached zero and the stopped clock should be persisted.
pub fn settle_clock(game: &mut GameRow, now: DateTime<Utc>) -> bool {
    if !game.timer_running {
        return false;
    }
    let reading = project_game_clock(game, now);
    if game.game_time.as_deref().unwrap_or_default() == reading.display && reading.running {
        return false;
    }
    game.game_time = Some(reading.display);
    if reading.running {
        return false;
    }
    stop_timer(game);
    game.updated_at = now.timestamp();
    true
}

fn stop_timer(game: &mut GameRow) {
    game.timer_running = false;
    game.timer_started_at = None;
    game.timer_started_seconds = None;
}

fn start_timer(game: &mut GameRow, seconds: i64, now: DateTime<Utc>) -> Result<(), AppError> {
    if seconds < 0 {
        return Err(AppError::BadRequest("timer_seconds must not be negative".to_string()));
    }
    game.timer_running = true;
    game.timer_started_at = Some(now.timestamp_millis());
    game.timer_started_seconds = Some(seconds);
    game.game_time = Some(clock::format_clock(seconds));
    Ok(())
}

pub fn apply_game_update(
    game: &mut GameRow,
    update: GameUpdate,
    now: DateTime<Utc>,
) -> Result<GameTransition, AppError> {
    for score in [update.home_score, update.away_score].into_iter().flatten() {
        if score < 0 {
            return Err(AppError::BadRequest("scores must not be negative".to_string()));
        }
    }

    // 先把计时投影写回，后续修改基于当前剩余时间
    settle_clock(game, now);

    let mut transition = GameTransition::default();
    let explicit_time = update.game_time.is_some();
    if let Some(home_score) = update.home_score {
        game.home_score = home_score;
    }
    if let Some(away_score) = update.away_score {
        game.away_score = away_score;
    }
    if let Some(quarter) = update.quarter {
        game.quarter = Some(quarter);
    }
    if let Some(game_time) = update.game_time {
        game.game_time = Some(game_time);
    }
    if let Some(display_state) = update.display_state {
        game.display_state = Some(display_state).filter(|s| !s.is_empty());
    }

    if let Some(status) = update.status {
        match status {
            GameStatus::Live if game.status != GameStatus::Live.as_str() => {
                game.started_at = Some(now.timestamp());
            }
            GameStatus::Final if game.status != GameStatus::Final.as_str() => {
                game.ended_at = Some(now.timestamp());
                transition.became_final = true;
            }
            _ => {}
        }
        game.status = status.as_str().to_string();
    }

    match update.timer_running {
        // 已在运行且未给出新时间时保留原锚点
        Some(true) if game.timer_running && update.timer_seconds.is_none() && !explicit_time => {}
        Some(true) => {
            let seconds = update
                .timer_seconds
                .or_else(|| game.game_time.as_deref().and_then(clock::parse_clock))
                .ok_or_else(|| AppError::BadRequest("timer_seconds is required to start the clock".to_string()))?;
            start_timer(game, seconds, now)?;
        }
        Some(false) => {
            if game.timer_running {
                let reading = project_game_clock(game, now);
                game.game_time = Some(reading.display);
            }
            stop_timer(game);
        }
        None => {
            if let Some(seconds) = update.timer_seconds {
                if game.timer_running {
                    start_timer(game, seconds, now)?;
                } else if seconds >= 0 {
                    game.game_time = Some(clock::format_clock(seconds));
                }
            }
        }
    }

    game.updated_at = now.timestamp();
    Ok(transition)
}

// ---------------------------------- 淘汰赛 ----------------------------------

/// Applies a match update to both the arena and its rows. Returns the arena
/// indices of every row that changed.
pub fn apply_match_update(
    bracket: &mut Bracket,
    rows: &mut [MatchRow],
    index: usize,
    update: MatchUpdate,
) -> Result<Vec<usize>, AppError> {
    for score in [update.team1_score, update.team2_score].into_iter().flatten() {
        if score < 0 {
            return Err(AppError::BadRequest("scores must not be negative".to_string()));
        }
    }
    let row = rows
        .get_mut(index)
        .ok_or_else(|| AppError::NotFound("Match not found".to_string()))?;
    if let Some(team1_score) = update.team1_score {
        row.team1_score = team1_score;
    }
    if let Some(team2_score) = update.team2_score {
        row.team2_score = team2_score;
    }
    if let Some(status) = update.status {
        row.status = status.as_str().to_string();
    }

    let mut changed = vec![index];
    let Some(winner) = update.winner_id else {
        return Ok(changed);
    };

    let advancement = bracket.advance(index, &winner)?;
    let row = &mut rows[index];
    row.winner_id = Some(winner.clone());
    if update.status.is_none() {
        row.status = MatchStatus::Completed.as_str().to_string();
    }

    if let Some(advancement) = advancement {
        let next = &mut rows[advancement.next_match];
        match advancement.slot {
            Slot::Team1 => next.team1_id = Some(winner),
            Slot::Team2 => next.team2_id = Some(winner),
        }
        changed.push(advancement.next_match);
    }
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::hub::RoomKind;
    use crate::models::{BroadcastEvent, RemovedPlayer};
    use crate::{routes, Config};
    use chrono::Duration;
    use tokio_tungstenite::tungstenite::Message as WsFrame;

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn game() -> GameRow {
        GameRow {
            id: "g1".to_string(),
            league_id: "l1".to_string(),
            home_team_id: "h".to_string(),
            away_team_id: "a".to_string(),
            home_score: 0,
            away_score: 0,
            status: "scheduled".to_string(),
            quarter: None,
            game_time: Some("12:00".to_string()),
            timer_running: false,
            timer_started_at: None,
            timer_started_seconds: None,
            display_state: None,
            scheduled_at: None,
            started_at: None,
            ended_at: None,
            share_code: "ABCD1234".to_string(),
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn status_transitions_stamp_times_once() {
        let mut g = game();
        let update = GameUpdate { status: Some(GameStatus::Live), ..Default::default() };
        assert_eq!(apply_game_update(&mut g, update, t0()).unwrap(), GameTransition::default());
        assert_eq!(g.started_at, Some(t0().timestamp()));

        let update = GameUpdate { status: Some(GameStatus::Final), home_score: Some(21), ..Default::default() };
        assert!(apply_game_update(&mut g, update, t0()).unwrap().became_final);
        assert_eq!(g.status, "final");

        let update = GameUpdate { status: Some(GameStatus::Final), ..Default::default() };
        assert!(!apply_game_update(&mut g, update, t0()).unwrap().became_final);
    }

    #[test]
    fn rejects_negative_scores() {
        let mut g = game();
        let update = GameUpdate { home_score: Some(-1), ..Default::default() };
        assert!(matches!(apply_game_update(&mut g, update, t0()), Err(AppError::BadRequest(_))));
        assert_eq!(g.home_score, 0);
    }

    #[test]
    fn starting_the_timer_anchors_it() {
        let mut g = game();
        let update = GameUpdate { timer_running: Some(true), timer_seconds: Some(90), ..Default::default() };
        apply_game_update(&mut g, update, t0()).unwrap();
        assert!(g.timer_running);
        assert_eq!(g.timer_started_at, Some(t0().timestamp_millis()));
        assert_eq!(g.timer_started_seconds, Some(90));
        assert_eq!(g.game_time.as_deref(), Some("1:30"));

        let reading = project_game_clock(&g, t0() + Duration::seconds(30));
        assert_eq!(reading.display, "1:00");
    }

    #[test]
    fn starting_without_seconds_uses_displayed_time() {
        let mut g = game();
        let update = GameUpdate { timer_running: Some(true), ..Default::default() };
        apply_game_update(&mut g, update, t0()).unwrap();
        assert_eq!(g.timer_started_seconds, Some(720));
    }

    #[test]
    fn stopping_the_timer_freezes_projection() {
        let mut g = game();
        let start = GameUpdate { timer_running: Some(true), timer_seconds: Some(90), ..Default::default() };
        apply_game_update(&mut g, start, t0()).unwrap();

        let stop = GameUpdate { timer_running: Some(false), ..Default::default() };
        apply_game_update(&mut g, stop, t0() + Duration::seconds(45)).unwrap();
        assert!(!g.timer_running);
        assert_eq!(g.timer_started_at, None);
        assert_eq!(g.game_time.as_deref(), Some("0:45"));
    }

    #[test]
    fn settle_stops_an_expired_clock() {
        let mut g = game();
        let start = GameUpdate { timer_running: Some(true), timer_seconds: Some(20), ..Default::default() };
        apply_game_update(&mut g, start, t0()).unwrap();

        let mut live = g.clone();
        assert!(!settle_clock(&mut live, t0() + Duration::seconds(5)));
        assert_eq!(live.game_time.as_deref(), Some("0:15"));
        assert!(live.timer_running);

        assert!(settle_clock(&mut g, t0() + Duration::seconds(25)));
        assert_eq!(g.game_time.as_deref(), Some("0:00"));
        assert!(!g.timer_running);
    }

    #[test]
    fn resending_running_keeps_the_anchor() {
        let mut g = game();
        let start = GameUpdate { timer_running: Some(true), timer_seconds: Some(600), ..Default::default() };
        apply_game_update(&mut g, start, t0()).unwrap();

        let later = t0() + Duration::seconds(30);
        let update = GameUpdate { timer_running: Some(true), home_score: Some(3), ..Default::default() };
        apply_game_update(&mut g, update, later).unwrap();
        assert_eq!(g.home_score, 3);
        assert_eq!(g.timer_started_at, Some(t0().timestamp_millis()));
        assert_eq!(g.timer_started_seconds, Some(600));
        assert_eq!(g.game_time.as_deref(), Some("9:30"));
        assert_eq!(project_game_clock(&g, later).display, "9:30");
    }

    #[test]
    fn explicit_time_restarts_a_running_clock() {
        let mut g = game();
        let start = GameUpdate { timer_running: Some(true), timer_seconds: Some(600), ..Default::default() };
        apply_game_update(&mut g, start, t0()).unwrap();

        let later = t0() + Duration::seconds(30);
        let update = GameUpdate {
            timer_running: Some(true),
            game_time: Some("5:00".to_string()),
            ..Default::default()
        };
        apply_game_update(&mut g, update, later).unwrap();
        assert_eq!(g.timer_started_at, Some(later.timestamp_millis()));
        assert_eq!(g.timer_started_seconds, Some(300));
    }

    #[test]
    fn update_after_expiry_stops_the_clock() {
        let mut g = game();
        let start = GameUpdate { timer_running: Some(true), timer_seconds: Some(20), ..Default::default() };
        apply_game_update(&mut g, start, t0()).unwrap();

        let update = GameUpdate { home_score: Some(1), ..Default::default() };
        apply_game_update(&mut g, update, t0() + Duration::seconds(25)).unwrap();
        assert_eq!(g.game_time.as_deref(), Some("0:00"));
        assert!(!g.timer_running);
        assert_eq!(g.timer_started_at, None);
    }

    #[test]
    fn settle_ignores_corrupt_anchor() {
        let mut g = game();
        let start = GameUpdate { timer_running: Some(true), timer_seconds: Some(20), ..Default::default() };
        apply_game_update(&mut g, start, t0()).unwrap();

        assert!(!settle_clock(&mut g, t0() - Duration::seconds(5)));
        assert_eq!(g.game_time.as_deref(), Some("0:20"));
        assert!(g.timer_running);
    }

    fn stored(bracket: &Bracket) -> Vec<MatchRow> {
        bracket
            .matches()
            .iter()
            .enumerate()
            .map(|(i, m)| MatchRow {
                id: format!("m{}", i),
                bracket_id: "b1".to_string(),
                round_number: i64::from(m.round_number),
                match_number: i as i64,
                team1_id: m.team1.clone(),
                team2_id: m.team2.clone(),
                team1_score: m.team1_score,
                team2_score: m.team2_score,
                winner_id: m.winner.clone(),
                status: m.status.as_str().to_string(),
                next_match_id: m.next_match.map(|n| format!("m{}", n)),
            })
            .collect()
    }

    #[test]
    fn match_winner_moves_into_next_row() {
        let ids: Vec<String> = ["a", "b", "c", "d"].iter().map(|s| s.to_string()).collect();
        let mut bracket = Bracket::build(4, &ids).unwrap();
        let mut rows = stored(&bracket);

        let update = MatchUpdate {
            team1_score: Some(3),
            team2_score: Some(1),
            winner_id: Some("a".to_string()),
            ..Default::default()
        };
        let changed = apply_match_update(&mut bracket, &mut rows, 0, update).unwrap();
        assert_eq!(changed, vec![0, 2]);
        assert_eq!(rows[0].winner_id.as_deref(), Some("a"));
        assert_eq!(rows[0].status, "completed");
        assert_eq!(rows[0].team1_score, 3);
        assert_eq!(rows[2].team1_id.as_deref(), Some("a"));

        let update = MatchUpdate { winner_id: Some("d".to_string()), ..Default::default() };
        apply_match_update(&mut bracket, &mut rows, 1, update).unwrap();
        assert_eq!(rows[2].team2_id.as_deref(), Some("d"));
    }

    #[test]
    fn match_update_without_winner_touches_one_row() {
        let ids: Vec<String> = ["a", "b"].iter().map(|s| s.to_string()).collect();
        let mut bracket = Bracket::build(2, &ids).unwrap();
        let mut rows = stored(&bracket);

        let update = MatchUpdate { status: Some(MatchStatus::Live), team1_score: Some(1), ..Default::default() };
        assert_eq!(apply_match_update(&mut bracket, &mut rows, 0, update).unwrap(), vec![0]);
        assert_eq!(rows[0].status, "live");

        let update = MatchUpdate { winner_id: Some("zzz".to_string()), ..Default::default() };
        assert!(matches!(
            apply_match_update(&mut bracket, &mut rows, 0, update),
            Err(AppError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn socket_viewer_receives_count_and_events() {
        let pool = db::connect("sqlite::memory:").await.unwrap();
        db::migrate(&pool).await.unwrap();
        let scoreboard = db::ScoreboardRow {
            id: db::new_id(),
            name: "Quiz night".to_string(),
            description: None,
            share_code: "ABCD1234".to_string(),
            is_public: true,
            created_at: 0,
            updated_at: 0,
        };
        db::insert_scoreboard(&mut pool.acquire().await.unwrap(), &scoreboard).await.unwrap();
        let state = Arc::new(AppState::new(pool, Config::default()));
        let app = routes::build_router(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app.into_make_service()).await.unwrap();
        });

        let url = format!("ws://{}/ws/scoreboard/abcd1234", addr);
        let (mut socket, _) = tokio_tungstenite::connect_async(url).await.unwrap();

        let first = socket.next().await.unwrap().unwrap();
        let WsFrame::Text(text) = first else { panic!("expected text frame") };
        let event: BroadcastEvent = serde_json::from_str(&text).unwrap();
        assert_eq!(event, BroadcastEvent::ViewerCount { count: 1 });
        assert_eq!(state.total_connections.load(Ordering::Relaxed), 1);

        let key = RoomKey::new(RoomKind::Scoreboard, "ABCD1234");
        let update = BroadcastEvent::PlayerRemoved { data: RemovedPlayer { id: "p1".to_string() } };
        assert_eq!(state.hub.publish(&key, update).await, 1);

        let WsFrame::Text(text) = socket.next().await.unwrap().unwrap() else {
            panic!("expected text frame")
        };
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "player_removed");
        assert_eq!(value["data"]["id"], "p1");

        socket.close(None).await.unwrap();
        for _ in 0..50 {
            if state.hub.viewer_count(&key).await == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert_eq!(state.hub.room_count().await, 0);
    }
}
