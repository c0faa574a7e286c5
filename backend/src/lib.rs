use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use santa_core::{
    AssignmentGenerator, Exclusions, Game, GameError, GameEvent, Name, Pick, Ticket, TicketNumber,
};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

mod config;

pub use config::Config;

#[derive(Clone)]
pub struct AppState {
    games: Arc<RwLock<HashMap<String, GameRecord>>>,
    channels: Arc<RwLock<HashMap<String, broadcast::Sender<ServerMessage>>>>,
    persist_path: Option<PathBuf>,
    /// Serializes snapshot writes so the file always ends on the newest state.
    persist_lock: Arc<Mutex<()>>,
    generator: AssignmentGenerator,
}

impl Default for AppState {
    fn default() -> Self {
        Self {
            games: Arc::new(RwLock::new(HashMap::new())),
            channels: Arc::new(RwLock::new(HashMap::new())),
            persist_path: None,
            persist_lock: Arc::new(Mutex::new(())),
            generator: AssignmentGenerator::default(),
        }
    }
}

impl AppState {
    pub async fn from_config(config: &Config) -> Self {
        let state = match &config.persist_path {
            Some(path) => Self::with_persistence(path.clone()).await,
            None => Self::default(),
        };
        state.with_generator(AssignmentGenerator::new(config.max_attempts))
    }

    pub fn with_generator(mut self, generator: AssignmentGenerator) -> Self {
        self.generator = generator;
        self
    }

    pub async fn with_persistence(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut state = Self::default();
        state.persist_path = Some(path.clone());
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) => {
                debug!(path = %path.display(), %err, "no snapshot loaded");
                return state;
            }
        };
        match serde_json::from_slice::<HashMap<String, GameRecord>>(&bytes) {
            Ok(saved) => {
                info!(path = %path.display(), games = saved.len(), "snapshot loaded");
                let mut channels = state.channels.write().await;
                for game_id in saved.keys() {
                    let (tx, _) = broadcast::channel(32);
                    channels.insert(game_id.clone(), tx);
                }
                drop(channels);
                *state.games.write().await = saved;
            }
            Err(err) => warn!(path = %path.display(), %err, "snapshot unreadable, starting empty"),
        }
        state
    }

    async fn persist(&self) {
        let Some(path) = &self.persist_path else {
            return;
        };
        // Taken before the snapshot: whoever writes last also read last.
        let _guard = self.persist_lock.lock().await;
        let snapshot = {
            let games = self.games.read().await;
            games.clone()
        };
        match serde_json::to_vec_pretty(&snapshot) {
            Ok(json) => {
                if let Err(err) = tokio::fs::write(path, json).await {
                    warn!(path = %path.display(), %err, "persist failed");
                }
            }
            Err(err) => warn!(%err, "snapshot serialization failed"),
        }
    }

    async fn publish(&self, game_id: &str, messages: Vec<ServerMessage>) {
        if let Some(tx) = self.channels.read().await.get(game_id) {
            for msg in messages {
                // no subscribers is fine
                let _ = tx.send(msg);
            }
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GameRecord {
    #[serde(flatten)]
    pub game: Game,
    pub admin_password: String,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/game", post(create_game))
        .route("/game/:id", get(get_game))
        .route("/game/:id/tickets", get(get_tickets))
        .route("/game/:id/draw", post(draw_name))
        .route("/game/:id/admin", get(admin_view))
        .route("/game/:id/admin/reset", post(reset_game))
        .route("/ws/:id", get(ws_handler))
        .route("/healthz", get(healthz))
        .with_state(state)
}

#[derive(Debug, thiserror::Error)]
enum ApiError {
    #[error("game not found")]
    GameNotFound,
    #[error("invalid admin password")]
    Unauthorized,
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Game(#[from] GameError),
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pick: Option<DrawResponse>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::GameNotFound => StatusCode::NOT_FOUND,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Game(err) => match err {
                GameError::UnknownParticipant(_) => StatusCode::NOT_FOUND,
                GameError::TooFewParticipants
                | GameError::EmptyName
                | GameError::DuplicateName(_)
                | GameError::InvalidTicket(_) => StatusCode::BAD_REQUEST,
                GameError::TicketTaken(_)
                | GameError::AlreadyPicked(_)
                | GameError::AssignmentMismatch => StatusCode::CONFLICT,
                GameError::Unsatisfiable(_) => StatusCode::UNPROCESSABLE_ENTITY,
                GameError::MissingRecipient(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        };
        // A returning picker gets their earlier draw back.
        let pick = match &self {
            ApiError::Game(GameError::AlreadyPicked(pick)) => {
                Some(DrawResponse::from(pick.clone()))
            }
            _ => None,
        };
        (
            status,
            Json(ErrorBody {
                error: self.to_string(),
                pick,
            }),
        )
            .into_response()
    }
}

#[derive(Deserialize)]
struct CreateGameRequest {
    names: Vec<Name>,
    #[serde(default)]
    exclusions: Exclusions,
    admin_password: String,
}

#[derive(Serialize)]
struct CreateGameResponse {
    game_id: String,
}

#[derive(Deserialize)]
struct DrawRequest {
    picker: Name,
    ticket_number: TicketNumber,
}

#[derive(Deserialize)]
struct DrawParams {
    seed: Option<u64>,
}

#[derive(Serialize)]
struct DrawResponse {
    picker: Name,
    recipient: Name,
    ticket_number: TicketNumber,
}

impl From<Pick> for DrawResponse {
    fn from(pick: Pick) -> Self {
        Self {
            picker: pick.picker,
            recipient: pick.recipient,
            ticket_number: pick.ticket_number,
        }
    }
}

#[derive(Serialize)]
struct TicketsResponse {
    tickets: Vec<Ticket>,
    taken_tickets: Vec<TicketNumber>,
}

#[derive(Serialize)]
struct AdminView {
    id: String,
    picks: Vec<Pick>,
    pending: Vec<Name>,
    assigned: bool,
}

/// What every participant may see. Recipients stay server-side.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct GameView {
    id: String,
    names: Vec<Name>,
    exclusions: Exclusions,
    tickets: Vec<Ticket>,
    picked: Vec<Name>,
    assigned: bool,
    created_at: u64,
}

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerMessage {
    State(GameView),
    Event(GameEvent),
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn check_admin(headers: &HeaderMap, record: &GameRecord) -> Result<(), ApiError> {
    let provided = headers
        .get("x-admin-password")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if provided != record.admin_password {
        return Err(ApiError::Unauthorized);
    }
    Ok(())
}

async fn healthz() -> &'static str {
    "ok"
}

async fn create_game(
    State(state): State<AppState>,
    Json(payload): Json<CreateGameRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let admin_password = payload.admin_password.trim();
    if admin_password.is_empty() {
        return Err(ApiError::BadRequest("admin password required".into()));
    }

    let game_id = Uuid::new_v4().to_string();
    let game = Game::new(
        game_id.clone(),
        payload.names,
        payload.exclusions,
        now_millis(),
    )?;
    info!(
        %game_id,
        participants = game.names.len(),
        exclusions = game.exclusions.len(),
        "game created"
    );

    let record = GameRecord {
        game,
        admin_password: admin_password.to_string(),
    };
    state.games.write().await.insert(game_id.clone(), record);
    let (tx, _) = broadcast::channel(32);
    state.channels.write().await.insert(game_id.clone(), tx);
    state.persist().await;

    Ok((StatusCode::CREATED, Json(CreateGameResponse { game_id })))
}

async fn get_game(
    State(state): State<AppState>,
    Path(game_id): Path<String>,
) -> Result<Json<GameView>, ApiError> {
    let games = state.games.read().await;
    let record = games.get(&game_id).ok_or(ApiError::GameNotFound)?;
    Ok(Json(to_view(&record.game)))
}

async fn get_tickets(
    State(state): State<AppState>,
    Path(game_id): Path<String>,
) -> Result<Json<TicketsResponse>, ApiError> {
    let games = state.games.read().await;
    let record = games.get(&game_id).ok_or(ApiError::GameNotFound)?;
    Ok(Json(TicketsResponse {
        tickets: santa_core::tickets(&record.game),
        taken_tickets: santa_core::taken_tickets(&record.game),
    }))
}

/// The write lock is held from the assignment check through storing the
/// pick, so concurrent first draws all see one assignment.
async fn draw_name(
    State(state): State<AppState>,
    Path(game_id): Path<String>,
    Query(params): Query<DrawParams>,
    Json(payload): Json<DrawRequest>,
) -> Result<Json<DrawResponse>, ApiError> {
    let mut rng = params
        .seed
        .map(ChaCha8Rng::seed_from_u64)
        .unwrap_or_else(|| ChaCha8Rng::from_entropy());

    let mut games = state.games.write().await;
    let record = games.get_mut(&game_id).ok_or(ApiError::GameNotFound)?;
    let had_assignment = record.game.assignments.is_some();

    let pick = match santa_core::draw(
        &mut record.game,
        payload.picker.trim(),
        payload.ticket_number,
        &state.generator,
        &mut rng,
        now_millis(),
    ) {
        Ok(pick) => pick,
        Err(GameError::Unsatisfiable(err)) => {
            warn!(%game_id, %err, "no assignment satisfies the exclusion rules");
            return Err(GameError::Unsatisfiable(err).into());
        }
        Err(err) => {
            debug!(%game_id, %err, "draw rejected");
            return Err(err.into());
        }
    };

    if !had_assignment {
        info!(
            %game_id,
            max_attempts = state.generator.max_attempts(),
            "assignment generated"
        );
    }
    info!(%game_id, picker = %pick.picker, ticket = pick.ticket_number, "name drawn");

    let view = to_view(&record.game);
    drop(games);

    state
        .publish(
            &game_id,
            vec![
                ServerMessage::Event(GameEvent::from(&pick)),
                ServerMessage::State(view),
            ],
        )
        .await;
    state.persist().await;

    Ok(Json(DrawResponse::from(pick)))
}

async fn admin_view(
    State(state): State<AppState>,
    Path(game_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<AdminView>, ApiError> {
    let games = state.games.read().await;
    let record = games.get(&game_id).ok_or(ApiError::GameNotFound)?;
    check_admin(&headers, record)?;

    Ok(Json(AdminView {
        id: record.game.id.clone(),
        picks: record.game.picks.clone(),
        pending: santa_core::pending_pickers(&record.game)
            .into_iter()
            .map(str::to_string)
            .collect(),
        assigned: record.game.assignments.is_some(),
    }))
}

async fn reset_game(
    State(state): State<AppState>,
    Path(game_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<GameView>, ApiError> {
    let mut games = state.games.write().await;
    let record = games.get_mut(&game_id).ok_or(ApiError::GameNotFound)?;
    check_admin(&headers, record)?;

    let cleared = record.game.picks.len();
    santa_core::reset(&mut record.game);
    info!(%game_id, cleared, "game reset");

    let view = to_view(&record.game);
    drop(games);

    state
        .publish(
            &game_id,
            vec![
                ServerMessage::Event(GameEvent::Reset),
                ServerMessage::State(view.clone()),
            ],
        )
        .await;
    state.persist().await;

    Ok(Json(view))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(game_id): Path<String>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, game_id))
}

async fn handle_socket(stream: WebSocket, state: AppState, game_id: String) {
    let (mut sender, mut receiver) = stream.split();

    let snapshot = {
        let games = state.games.read().await;
        match games.get(&game_id) {
            Some(record) => to_view(&record.game),
            None => {
                let _ = sender.send(Message::Text("unknown game".into())).await;
                return;
            }
        }
    };

    let mut rx = {
        let mut channels = state.channels.write().await;
        channels
            .entry(game_id.clone())
            .or_insert_with(|| {
                let (tx, _) = broadcast::channel(32);
                tx
            })
            .subscribe()
    };
    debug!(%game_id, "socket subscribed");

    if send_message(&mut sender, &ServerMessage::State(snapshot))
        .await
        .is_err()
    {
        return;
    }

    let mut send_task = tokio::spawn(async move {
        while let Ok(msg) = rx.recv().await {
            if send_message(&mut sender, &msg).await.is_err() {
                break;
            }
        }
    });

    // Clients only listen; drain until they go away.
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            if matches!(msg, Message::Close(_)) {
                break;
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }
    debug!(%game_id, "socket closed");
}

async fn send_message(
    sender: &mut SplitSink<WebSocket, Message>,
    msg: &ServerMessage,
) -> Result<(), axum::Error> {
    let text = serde_json::to_string(msg).map_err(axum::Error::new)?;
    sender.send(Message::Text(text)).await
}

fn to_view(game: &Game) -> GameView {
    GameView {
        id: game.id.clone(),
        names: game.names.clone(),
        exclusions: game.exclusions.clone(),
        tickets: santa_core::tickets(game),
        picked: game.picks.iter().map(|p| p.picker.clone()).collect(),
        assigned: game.assignments.is_some(),
        created_at: game.created_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    async fn json_body(res: axum::response::Response) -> Value {
        let bytes = res.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn test_app() -> (Router, AppState) {
        let state = AppState::default();
        (app(state.clone()), state)
    }

    async fn post_json(app: &Router, uri: &str, body: Value) -> Response {
        app.clone()
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri(uri)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap()
    }

    async fn get_uri(app: &Router, uri: &str, password: Option<&str>) -> Response {
        let mut builder = Request::builder().method(Method::GET).uri(uri);
        if let Some(password) = password {
            builder = builder.header("x-admin-password", password);
        }
        app.clone()
            .oneshot(builder.body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    async fn reset(app: &Router, game_id: &str, password: &str) -> Response {
        app.clone()
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri(format!("/game/{game_id}/admin/reset"))
                    .header("x-admin-password", password)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap()
    }

    async fn create(app: &Router, names: &[&str], exclusions: Value) -> String {
        let res = post_json(
            app,
            "/game",
            json!({ "names": names, "exclusions": exclusions, "admin_password": "hohoho" }),
        )
        .await;
        assert_eq!(res.status(), StatusCode::CREATED);
        json_body(res).await["game_id"].as_str().unwrap().to_string()
    }

    async fn draw(app: &Router, game_id: &str, picker: &str, ticket: u32) -> Response {
        post_json(
            app,
            &format!("/game/{game_id}/draw"),
            json!({ "picker": picker, "ticket_number": ticket }),
        )
        .await
    }

    #[tokio::test]
    async fn create_game_validates_roster_and_password() {
        let (app, _) = test_app();

        let res = post_json(
            &app,
            "/game",
            json!({ "names": ["alice", "bob"], "admin_password": "  " }),
        )
        .await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        let res = post_json(
            &app,
            "/game",
            json!({ "names": ["alice", "alice"], "admin_password": "pw" }),
        )
        .await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        let body = json_body(res).await;
        assert!(body["error"].as_str().unwrap().contains("duplicate"));

        let res = post_json(
            &app,
            "/game",
            json!({ "names": ["alice"], "admin_password": "pw" }),
        )
        .await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        let res = post_json(
            &app,
            "/game",
            json!({ "names": ["alice", "bob", "carol"], "admin_password": "pw" }),
        )
        .await;
        assert_eq!(res.status(), StatusCode::CREATED);
        assert!(json_body(res).await["game_id"].as_str().is_some());
    }

    #[tokio::test]
    async fn draw_flow_enforces_tickets_and_single_pick() {
        let (app, _) = test_app();
        let game_id = create(
            &app,
            &["alice", "bob", "carol", "dave"],
            json!({ "alice": ["bob"], "bob": ["alice"] }),
        )
        .await;

        let res = draw(&app, &game_id, "alice", 1).await;
        assert_eq!(res.status(), StatusCode::OK);
        let body = json_body(res).await;
        assert_eq!(body["picker"], "alice");
        assert_eq!(body["ticket_number"], 1);
        let recipient = body["recipient"].as_str().unwrap();
        assert!(recipient != "alice" && recipient != "bob");

        // ticket already claimed
        let res = draw(&app, &game_id, "bob", 1).await;
        assert_eq!(res.status(), StatusCode::CONFLICT);

        // alice cannot draw twice, but gets her earlier draw back
        let res = draw(&app, &game_id, "alice", 2).await;
        assert_eq!(res.status(), StatusCode::CONFLICT);
        let body = json_body(res).await;
        assert_eq!(
            body["pick"],
            json!({ "picker": "alice", "recipient": recipient, "ticket_number": 1 })
        );

        // other conflicts carry no pick
        let res = draw(&app, &game_id, "carol", 1).await;
        assert_eq!(res.status(), StatusCode::CONFLICT);
        assert!(json_body(res).await.get("pick").is_none());

        let res = draw(&app, &game_id, "mallory", 2).await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);

        let res = draw(&app, &game_id, "bob", 9).await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        let res = draw(&app, "unknown", "bob", 2).await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);

        let res = get_uri(&app, &format!("/game/{game_id}/tickets"), None).await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(json_body(res).await["taken_tickets"], json!([1]));
    }

    #[tokio::test]
    async fn public_view_never_exposes_recipients() {
        let (app, _) = test_app();
        let game_id = create(&app, &["alice", "bob", "carol"], json!({})).await;
        assert_eq!(draw(&app, &game_id, "carol", 2).await.status(), StatusCode::OK);

        let res = get_uri(&app, &format!("/game/{game_id}"), None).await;
        assert_eq!(res.status(), StatusCode::OK);
        let view = json_body(res).await;
        assert_eq!(view["assigned"], true);
        assert_eq!(view["picked"], json!(["carol"]));
        assert_eq!(view["tickets"][1], json!({ "number": 2, "taken": true }));
        assert!(view.get("assignments").is_none());
        assert!(view.get("picks").is_none());
        assert!(view.get("admin_password").is_none());

        let res = get_uri(&app, "/game/unknown", None).await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unsatisfiable_exclusions_report_unprocessable() {
        let (app, state) = test_app();
        let game_id = create(
            &app,
            &["alice", "bob"],
            json!({ "alice": ["bob"], "bob": ["alice"] }),
        )
        .await;

        let res = draw(&app, &game_id, "alice", 1).await;
        assert_eq!(res.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body = json_body(res).await;
        assert!(body["error"].as_str().unwrap().contains("exclusion rules"));

        let games = state.games.read().await;
        let game = &games[&game_id].game;
        assert!(game.assignments.is_none());
        assert!(game.picks.is_empty());
    }

    #[tokio::test]
    async fn seeded_draws_are_reproducible() {
        let (app, _) = test_app();
        let names = ["a", "b", "c", "d", "e", "f"];
        let first = create(&app, &names, json!({})).await;
        let second = create(&app, &names, json!({})).await;

        let mut recipients = Vec::new();
        for game_id in [&first, &second] {
            let res = post_json(
                &app,
                &format!("/game/{game_id}/draw?seed=42"),
                json!({ "picker": "c", "ticket_number": 3 }),
            )
            .await;
            assert_eq!(res.status(), StatusCode::OK);
            recipients.push(json_body(res).await["recipient"].clone());
        }
        assert_eq!(recipients[0], recipients[1]);
    }

    #[tokio::test]
    async fn admin_requires_password_and_reset_clears_everything() {
        let (app, state) = test_app();
        let game_id = create(&app, &["alice", "bob", "carol"], json!({})).await;
        assert_eq!(draw(&app, &game_id, "alice", 1).await.status(), StatusCode::OK);
        assert_eq!(draw(&app, &game_id, "bob", 3).await.status(), StatusCode::OK);

        let uri = format!("/game/{game_id}/admin");
        assert_eq!(get_uri(&app, &uri, None).await.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            get_uri(&app, &uri, Some("wrong")).await.status(),
            StatusCode::UNAUTHORIZED
        );

        let res = get_uri(&app, &uri, Some("hohoho")).await;
        assert_eq!(res.status(), StatusCode::OK);
        let admin = json_body(res).await;
        assert_eq!(admin["picks"].as_array().unwrap().len(), 2);
        assert_eq!(admin["pending"], json!(["carol"]));
        assert_eq!(admin["assigned"], true);

        assert_eq!(
            reset(&app, &game_id, "wrong").await.status(),
            StatusCode::UNAUTHORIZED
        );
        let res = reset(&app, &game_id, "hohoho").await;
        assert_eq!(res.status(), StatusCode::OK);
        let view = json_body(res).await;
        assert_eq!(view["assigned"], false);
        assert_eq!(view["picked"], json!([]));

        {
            let games = state.games.read().await;
            assert!(games[&game_id].game.assignments.is_none());
        }

        // tickets are free again after the reset
        assert_eq!(draw(&app, &game_id, "bob", 1).await.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn concurrent_first_draws_share_one_assignment() {
        let (app, state) = test_app();
        let names = ["a", "b", "c", "d", "e", "f", "g", "h"];
        let game_id = create(&app, &names, json!({ "a": ["b"], "b": ["a"] })).await;

        let handles: Vec<_> = names
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let app = app.clone();
                let game_id = game_id.clone();
                let name = name.to_string();
                tokio::spawn(async move {
                    let res = draw(&app, &game_id, &name, i as u32 + 1).await;
                    assert_eq!(res.status(), StatusCode::OK);
                    json_body(res).await
                })
            })
            .collect();

        let mut recipients = std::collections::HashSet::new();
        for handle in handles {
            let body = handle.await.unwrap();
            recipients.insert(body["recipient"].as_str().unwrap().to_string());
        }
        assert_eq!(recipients.len(), names.len());

        let games = state.games.read().await;
        let game = &games[&game_id].game;
        let assignments = game.assignments.as_ref().unwrap();
        assert!(santa_core::is_valid_assignment(
            &game.names,
            &game.exclusions,
            assignments
        ));
        for pick in &game.picks {
            assert_eq!(assignments[&pick.picker], pick.recipient);
        }
    }

    #[tokio::test]
    async fn broadcasts_never_reveal_recipients() {
        let (app, state) = test_app();
        let game_id = create(&app, &["alice", "bob", "carol"], json!({})).await;
        let mut rx = state.channels.read().await[&game_id].subscribe();

        assert_eq!(draw(&app, &game_id, "alice", 1).await.status(), StatusCode::OK);
        assert_eq!(reset(&app, &game_id, "hohoho").await.status(), StatusCode::OK);

        let mut messages = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            messages.push(serde_json::to_value(&msg).unwrap());
        }
        assert_eq!(messages.len(), 4);
        assert_eq!(
            messages[0],
            json!({ "type": "event", "event": "pick_made", "picker": "alice", "ticket_number": 1 })
        );
        assert_eq!(messages[1]["type"], "state");
        assert_eq!(messages[2], json!({ "type": "event", "event": "reset" }));
        for msg in &messages {
            let text = msg.to_string();
            assert!(!text.contains("recipient"));
            assert!(!text.contains("assignments"));
        }
    }

    #[tokio::test]
    async fn concurrent_draws_all_reach_the_snapshot() {
        let path = std::env::temp_dir().join(format!("santa_state_{}.json", Uuid::new_v4()));
        let state = AppState::with_persistence(path.clone()).await;
        let app = app(state.clone());
        let names = ["a", "b", "c", "d", "e", "f", "g", "h", "i", "j"];
        let game_id = create(&app, &names, json!({})).await;

        let handles: Vec<_> = names
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let app = app.clone();
                let game_id = game_id.clone();
                let name = name.to_string();
                tokio::spawn(async move {
                    draw(&app, &game_id, &name, i as u32 + 1).await.status()
                })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.await.unwrap(), StatusCode::OK);
        }

        let loaded = AppState::with_persistence(path.clone()).await;
        {
            let games = loaded.games.read().await;
            let game = &games[&game_id].game;
            assert_eq!(game.picks.len(), names.len());
            assert_eq!(game.assignments, state.games.read().await[&game_id].game.assignments);
        }

        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn persistence_writes_and_loads_games() {
        let path = std::env::temp_dir().join(format!("santa_state_{}.json", Uuid::new_v4()));
        let state = AppState::with_persistence(path.clone()).await;
        let app = app(state.clone());

        let game_id = create(&app, &["alice", "bob", "carol"], json!({})).await;
        let res = draw(&app, &game_id, "bob", 2).await;
        assert_eq!(res.status(), StatusCode::OK);
        let recipient = json_body(res).await["recipient"].as_str().unwrap().to_string();

        assert!(tokio::fs::metadata(&path).await.is_ok());

        let loaded = AppState::with_persistence(path.clone()).await;
        {
            let games = loaded.games.read().await;
            assert_eq!(games.len(), 1);
            let record = &games[&game_id];
            assert_eq!(record.admin_password, "hohoho");
            assert_eq!(record.game.picks.len(), 1);
            assert_eq!(
                record.game.assignments.as_ref().unwrap()["bob"],
                recipient
            );
            assert!(loaded.channels.read().await.contains_key(&game_id));
        }

        // the reloaded state keeps serving the same assignment
        let app = super::app(loaded);
        let res = draw(&app, &game_id, "bob", 1).await;
        assert_eq!(res.status(), StatusCode::CONFLICT);

        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn healthz_responds() {
        let (app, _) = test_app();
        let res = get_uri(&app, "/healthz", None).await;
        assert_eq!(res.status(), StatusCode::OK);
    }
}
