use std::{
    collections::HashMap,
    future::IntoFuture,
    io::ErrorKind,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex as StdMutex, MutexGuard, OnceLock, PoisonError,
    },
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::{
    net::TcpListener,
    sync::{mpsc, Mutex},
};
use tracing::{info, warn};

use teapot_common::{
    config::parse_checkpoint, dispatch, interpret, messages, poll_remote, telegram, AnalogInput,
    BotConfig, BotSession, BotTransport, ButtonMailbox, DeviceVitals, HeaterEvent, HeaterOutput,
    OutputError, StatusReport, TeapotConfig, TeapotEngine, TelegramError, TemperatureSampler, Update,
};

const CONTROL_PERIOD_MS: u64 = 20;
const DEFAULT_SIMULATED_HOLD_MS: u64 = 100;
const MAX_SIMULATED_HOLD_MS: u64 = 10_000;
const TELEGRAM_TIMEOUT: Duration = Duration::from_secs(10);

const AMBIENT_C: f32 = 20.0;
const BOILING_C: f32 = 100.0;
const HEATING_RATE_C_PER_S: f32 = 0.8;
const COOLING_COEFF_PER_S: f32 = 0.002;
const ADC_FULL_SCALE: f32 = 1023.0;

type Engine = TeapotEngine<SimHeater>;
type SharedKettle = Arc<StdMutex<Kettle>>;

#[derive(Clone)]
struct AppState {
    engine: Arc<Mutex<Engine>>,
    mailbox: Arc<ButtonMailbox>,
    outbox: mpsc::UnboundedSender<String>,
    restart_requested: Arc<AtomicBool>,
    vitals: Arc<DeviceVitals>,
    remote_enabled: bool,
    store: AppStore,
}

#[derive(Clone)]
struct AppStore {
    config_path: Arc<PathBuf>,
    checkpoint_path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    #[serde(flatten)]
    status: StatusReport,
    vitals: DeviceVitals,
    #[serde(rename = "remoteEnabled")]
    remote_enabled: bool,
    #[serde(rename = "nowEpoch")]
    now_epoch: i64,
}

#[derive(Debug, Serialize)]
struct CommandResponse {
    replies: Vec<String>,
    restart: bool,
}

#[derive(Debug, Serialize)]
struct ButtonAccepted {
    #[serde(rename = "holdMs")]
    hold_ms: u64,
}

#[derive(Debug, Serialize)]
struct BotConfigView {
    #[serde(rename = "chatId")]
    chat_id: String,
    #[serde(rename = "botTokenSet")]
    bot_token_set: bool,
    #[serde(rename = "remoteEnabled")]
    remote_enabled: bool,
}

#[derive(Debug, Deserialize)]
struct BotConfigUpdate {
    #[serde(rename = "botToken", default)]
    bot_token: Option<String>,
    #[serde(rename = "chatId")]
    chat_id: String,
}

#[derive(Debug, Serialize)]
struct BotConfigUpdateResponse {
    #[serde(rename = "restartRequired")]
    restart_required: bool,
    bot: BotConfigView,
}

#[derive(Debug, Serialize)]
struct OtaStatusResponse {
    supported: bool,
    #[serde(rename = "inProgress")]
    in_progress: bool,
    #[serde(rename = "lastError")]
    last_error: Option<String>,
}

/// Water temperature model standing in for the element and thermistor.
#[derive(Debug)]
struct Kettle {
    water_c: f32,
    heating: bool,
}

impl Kettle {
    fn new() -> Self {
        Self {
            water_c: AMBIENT_C,
            heating: false,
        }
    }

    fn advance(&mut self, elapsed: Duration) {
        let seconds = elapsed.as_secs_f32();
        if self.heating {
            self.water_c += HEATING_RATE_C_PER_S * seconds;
        }
        self.water_c -= (self.water_c - AMBIENT_C) * COOLING_COEFF_PER_S * seconds;
        self.water_c = self.water_c.min(BOILING_C);
    }

    fn adc_counts(&self, divisor: f32) -> u16 {
        (self.water_c * divisor).round().clamp(0.0, ADC_FULL_SCALE) as u16
    }
}

fn lock_kettle(kettle: &SharedKettle) -> MutexGuard<'_, Kettle> {
    kettle.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Advances the simulation by the wall time since the previous step.
fn step_kettle(kettle: &SharedKettle, last_step: &mut Instant, now: Instant) {
    lock_kettle(kettle).advance(now.saturating_duration_since(*last_step));
    *last_step = now;
}

struct SimAdc {
    kettle: SharedKettle,
    divisor: f32,
}

impl AnalogInput for SimAdc {
    fn read_raw(&mut self) -> Option<u16> {
        Some(lock_kettle(&self.kettle).adc_counts(self.divisor))
    }
}

#[derive(Debug)]
struct SimHeater {
    kettle: SharedKettle,
}

impl HeaterOutput for SimHeater {
    fn set_heater(&mut self, on: bool) -> Result<(), OutputError> {
        lock_kettle(&self.kettle).heating = on;
        info!("heater relay {}", if on { "on" } else { "off" });
        Ok(())
    }
}

struct UreqTransport {
    agent: ureq::Agent,
    token: String,
}

impl UreqTransport {
    fn new(token: String) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(TELEGRAM_TIMEOUT)
            .user_agent(concat!("teapot-controller/", env!("CARGO_PKG_VERSION")))
            .build();
        Self { agent, token }
    }
}

impl BotTransport for UreqTransport {
    fn get_updates(&mut self, offset: i64) -> Result<Vec<Update>, TelegramError> {
        let response = self
            .agent
            .get(&telegram::get_updates_url(&self.token, offset))
            .call()
            .map_err(map_ureq_error)?;
        telegram::parse_updates(read_body(response)?.as_bytes())
    }

    fn send_message(&mut self, chat_id: &str, text: &str) -> Result<(), TelegramError> {
        let body = telegram::send_message_body(chat_id, text)?;
        let response = self
            .agent
            .post(&telegram::send_message_url(&self.token))
            .set("Content-Type", "application/json")
            .send_bytes(&body)
            .map_err(map_ureq_error)?;
        telegram::check_send_response(read_body(response)?.as_bytes())
    }
}

fn map_ureq_error(err: ureq::Error) -> TelegramError {
    match err {
        ureq::Error::Status(code, _) => TelegramError::Status(code),
        ureq::Error::Transport(transport) => TelegramError::Transport(transport.to_string()),
    }
}

fn read_body(response: ureq::Response) -> Result<String, TelegramError> {
    response
        .into_string()
        .map_err(|err| TelegramError::Transport(err.to_string()))
}

struct RemoteLink {
    session: BotSession,
    transport: UreqTransport,
}

impl RemoteLink {
    fn deliver(&mut self, texts: &[String]) {
        for text in texts {
            if let Err(err) = self.session.notify(&mut self.transport, text) {
                warn!("failed to deliver notification {text:?}: {err}");
            }
        }
    }
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = AppStore::new();
    let mut bot = store.load_bot_config().await.unwrap_or_else(|err| {
        warn!("failed to load bot config from store: {err:#}");
        BotConfig::default()
    });
    if let Ok(token) = std::env::var("TEAPOT_BOT_TOKEN") {
        bot.bot_token = token;
    }
    if let Ok(chat_id) = std::env::var("TEAPOT_CHAT_ID") {
        bot.chat_id = chat_id;
    }
    bot.sanitize();

    let mut config = TeapotConfig::default();
    config.sanitize();

    let kettle: SharedKettle = Arc::new(StdMutex::new(Kettle::new()));
    let sampler = TemperatureSampler::new(
        SimAdc {
            kettle: kettle.clone(),
            divisor: config.adc_divisor,
        },
        &config,
    );
    let engine = TeapotEngine::new(
        config.clone(),
        SimHeater {
            kettle: kettle.clone(),
        },
    );

    let remote = if bot.remote_enabled() {
        let checkpoint = store.load_checkpoint().await.unwrap_or_else(|err| {
            warn!("failed to load message checkpoint: {err:#}");
            None
        });
        info!(chat_id = %bot.chat_id, ?checkpoint, "telegram remote enabled");
        Some(RemoteLink {
            session: BotSession::new(bot.chat_id.clone()).resume_from(checkpoint),
            transport: UreqTransport::new(bot.bot_token.clone()),
        })
    } else {
        info!("telegram remote disabled: no bot token or chat id configured");
        None
    };

    let port = std::env::var("TEAPOT_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind teapot server at {addr}"))?;

    let (outbox, outbox_rx) = mpsc::unbounded_channel();
    let app_state = AppState {
        engine: Arc::new(Mutex::new(engine)),
        mailbox: Arc::new(ButtonMailbox::new(config.long_press_ms)),
        outbox,
        restart_requested: Arc::new(AtomicBool::new(false)),
        vitals: Arc::new(DeviceVitals {
            ip: addr.ip().to_string(),
            ..DeviceVitals::default()
        }),
        remote_enabled: remote.is_some(),
        store,
    };

    queue_notice(&app_state.outbox, messages::welcome_text(&config));
    queue_notice(&app_state.outbox, messages::ready_text());

    let control = tokio::spawn(run_control_loop(
        app_state.clone(),
        kettle,
        sampler,
        remote,
        outbox_rx,
        config,
    ));

    let app = Router::new()
        .route("/api/status", get(handle_get_status))
        .route("/api/command", post(handle_post_command))
        .route("/api/button", post(handle_post_button))
        .route(
            "/api/config",
            get(handle_get_config).put(handle_put_config),
        )
        .route("/api/ota/status", get(handle_get_ota_status))
        .route("/api/ota/apply", post(handle_post_ota_apply))
        .with_state(app_state);

    info!("teapot controller listening on http://{addr}");
    tokio::select! {
        served = axum::serve(listener, app).into_future() => {
            served.context("http server stopped")?;
        }
        finished = control => {
            finished.context("control loop task panicked")??;
            info!("restart requested, exiting");
        }
    }
    Ok(())
}

async fn run_control_loop(
    app_state: AppState,
    kettle: SharedKettle,
    mut sampler: TemperatureSampler<SimAdc>,
    mut remote: Option<RemoteLink>,
    mut outbox: mpsc::UnboundedReceiver<String>,
    config: TeapotConfig,
) -> anyhow::Result<()> {
    let period = Duration::from_millis(CONTROL_PERIOD_MS);
    let mut interval = tokio::time::interval(period);
    let mut last_poll_ms: Option<u64> = None;
    let mut last_step = Instant::now();

    loop {
        interval.tick().await;
        step_kettle(&kettle, &mut last_step, Instant::now());
        let now_ms = monotonic_ms();

        let temp = sampler.sample(now_ms);
        app_state.engine.lock().await.observe_temperature(temp);

        if let Some(event) = app_state.mailbox.take() {
            let events = app_state.engine.lock().await.apply_button(event);
            info!(?event, temp, "button event");
            queue_events(&app_state.outbox, &events);
            app_state.mailbox.rearm();
        }

        let poll_due = last_poll_ms
            .map_or(true, |last| now_ms.saturating_sub(last) >= config.bot_polling_interval_ms);
        match remote.take() {
            Some(link) if poll_due => {
                last_poll_ms = Some(now_ms);
                let pending = drain_outbox(&mut outbox);
                let (link, restart) = run_remote_round(
                    link,
                    pending,
                    app_state.engine.clone(),
                    app_state.vitals.clone(),
                )
                .await?;
                remote = Some(link);
                if restart {
                    app_state.restart_requested.store(true, Ordering::Release);
                }
            }
            Some(link) => remote = Some(link),
            None => {
                for text in drain_outbox(&mut outbox) {
                    info!(notification = %text, "remote disabled, notification not delivered");
                }
            }
        }

        if app_state.restart_requested.load(Ordering::Acquire) {
            if let Some(link) = remote {
                let pending = drain_outbox(&mut outbox);
                let link = tokio::task::spawn_blocking(move || {
                    let mut link = link;
                    link.deliver(&pending);
                    link
                })
                .await
                .context("notification flush task panicked")?;
                app_state
                    .store
                    .save_checkpoint(link.session.last_message_received())
                    .await
                    .context("failed to persist message checkpoint")?;
            }
            return Ok(());
        }

        let events = app_state.engine.lock().await.tick(temp);
        if !events.is_empty() {
            info!(temp, ?events, "control law transition");
        }
        queue_events(&app_state.outbox, &events);
    }
}

/// Delivers queued notifications and polls Telegram on a blocking thread. The
/// engine stays locked for the whole round so commands apply in order.
async fn run_remote_round(
    mut link: RemoteLink,
    pending: Vec<String>,
    engine: Arc<Mutex<Engine>>,
    vitals: Arc<DeviceVitals>,
) -> anyhow::Result<(RemoteLink, bool)> {
    tokio::task::spawn_blocking(move || {
        link.deliver(&pending);

        let mut engine = engine.blocking_lock();
        let restart = match poll_remote(
            &mut link.session,
            &mut link.transport,
            &mut *engine,
            &vitals,
        ) {
            Ok(outcome) => {
                if outcome.processed > 0 || outcome.rejected > 0 {
                    info!(
                        processed = outcome.processed,
                        rejected = outcome.rejected,
                        checkpoint = link.session.last_message_received(),
                        "telegram round"
                    );
                }
                if outcome.failed_replies > 0 {
                    warn!("{} telegram replies failed to send", outcome.failed_replies);
                }
                outcome.restart
            }
            Err(err) => {
                warn!("telegram poll failed: {err}");
                false
            }
        };
        (link, restart)
    })
    .await
    .context("telegram round task panicked")
}

fn queue_events(outbox: &mpsc::UnboundedSender<String>, events: &[HeaterEvent]) {
    for event in events {
        queue_notice(outbox, messages::event_text(event));
    }
}

fn queue_notice(outbox: &mpsc::UnboundedSender<String>, text: String) {
    if outbox.send(text).is_err() {
        warn!("notification outbox closed");
    }
}

fn drain_outbox(outbox: &mut mpsc::UnboundedReceiver<String>) -> Vec<String> {
    let mut pending = Vec::new();
    while let Ok(text) = outbox.try_recv() {
        pending.push(text);
    }
    pending
}

async fn handle_get_status(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.engine.lock().await.status();
    Json(StatusResponse {
        status,
        vitals: (*state.vitals).clone(),
        remote_enabled: state.remote_enabled,
        now_epoch: Utc::now().timestamp(),
    })
}

async fn handle_post_command(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(text) = params.get("text") else {
        return error_response(StatusCode::BAD_REQUEST, "Missing 'text' parameter");
    };

    let command = interpret(text);
    let result = {
        let mut engine = state.engine.lock().await;
        dispatch(&mut *engine, &command, &state.vitals)
    };
    info!(?command, replies = ?result.replies, "local command");

    if result.restart {
        state.restart_requested.store(true, Ordering::Release);
    }

    Json(CommandResponse {
        replies: result.replies,
        restart: result.restart,
    })
    .into_response()
}

async fn handle_post_button(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let hold_ms = match params.get("holdMs") {
        None => DEFAULT_SIMULATED_HOLD_MS,
        Some(value) => match value.parse::<u64>() {
            Ok(ms) if ms <= MAX_SIMULATED_HOLD_MS => ms,
            _ => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    "holdMs must be between 0 and 10000",
                )
            }
        },
    };

    if !state.mailbox.is_armed() {
        return error_response(StatusCode::CONFLICT, "A button event is still pending");
    }

    let mailbox = state.mailbox.clone();
    tokio::spawn(async move {
        mailbox.on_press(isr_clock_ms());
        tokio::time::sleep(Duration::from_millis(hold_ms)).await;
        mailbox.on_release(isr_clock_ms());
    });

    (StatusCode::ACCEPTED, Json(ButtonAccepted { hold_ms })).into_response()
}

async fn handle_get_config(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.load_bot_config().await {
        Ok(bot) => Json(build_bot_config_view(&bot)).into_response(),
        Err(err) => {
            warn!("failed to load bot config: {err:#}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to load bot config")
        }
    }
}

async fn handle_put_config(
    State(state): State<AppState>,
    Json(update): Json<BotConfigUpdate>,
) -> impl IntoResponse {
    let mut bot = match state.store.load_bot_config().await {
        Ok(bot) => bot,
        Err(err) => {
            warn!("stored bot config unreadable, replacing it: {err:#}");
            BotConfig::default()
        }
    };

    bot.chat_id = update.chat_id;
    if let Some(token) = update.bot_token {
        bot.bot_token = token;
    }
    bot.sanitize();

    if let Err(err) = state.store.save_bot_config(&bot).await {
        warn!("failed to persist bot config: {err:#}");
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to persist bot config");
    }

    Json(BotConfigUpdateResponse {
        restart_required: true,
        bot: build_bot_config_view(&bot),
    })
    .into_response()
}

async fn handle_get_ota_status() -> impl IntoResponse {
    Json(OtaStatusResponse {
        supported: false,
        in_progress: false,
        last_error: Some("OTA apply is only available in ESP32 builds".to_string()),
    })
}

async fn handle_post_ota_apply() -> impl IntoResponse {
    error_response(
        StatusCode::NOT_IMPLEMENTED,
        "OTA apply is only available in ESP32 builds",
    )
}

impl AppStore {
    fn new() -> Self {
        let data_dir = std::env::var("TEAPOT_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.teapot"));

        Self {
            config_path: Arc::new(data_dir.join("config.json")),
            checkpoint_path: Arc::new(data_dir.join("last_msg_id.txt")),
            lock: Arc::new(Mutex::new(())),
        }
    }

    async fn load_bot_config(&self) -> anyhow::Result<BotConfig> {
        let _guard = self.lock.lock().await;
        match tokio::fs::read(self.config_path.as_ref()).await {
            Ok(raw) => Ok(BotConfig::from_json(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(BotConfig::default()),
            Err(err) => Err(err.into()),
        }
    }

    async fn save_bot_config(&self, bot: &BotConfig) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        write_file(self.config_path.as_ref(), bot.to_json()?.into_bytes()).await
    }

    async fn load_checkpoint(&self) -> anyhow::Result<Option<i64>> {
        let _guard = self.lock.lock().await;
        match tokio::fs::read_to_string(self.checkpoint_path.as_ref()).await {
            Ok(raw) => Ok(parse_checkpoint(&raw)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn save_checkpoint(&self, last_message_id: i64) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        write_file(
            self.checkpoint_path.as_ref(),
            last_message_id.to_string().into_bytes(),
        )
        .await
    }
}

async fn write_file(path: &Path, payload: Vec<u8>) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, payload)
        .await
        .with_context(|| format!("failed to write {}", path.display()))
}

fn build_bot_config_view(bot: &BotConfig) -> BotConfigView {
    BotConfigView {
        chat_id: bot.chat_id.clone(),
        bot_token_set: !bot.bot_token.is_empty(),
        remote_enabled: bot.remote_enabled(),
    }
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

/// Wrapping millisecond clock for the button mailbox.
fn isr_clock_ms() -> u32 {
    monotonic_ms() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simulated_engine(kettle: &SharedKettle) -> (TemperatureSampler<SimAdc>, Engine) {
        let config = TeapotConfig::default();
        let sampler = TemperatureSampler::new(
            SimAdc {
                kettle: kettle.clone(),
                divisor: config.adc_divisor,
            },
            &config,
        );
        let engine = TeapotEngine::new(
            config,
            SimHeater {
                kettle: kettle.clone(),
            },
        );
        (sampler, engine)
    }

    #[test]
    fn kettle_reads_ambient_through_the_sampler() {
        let kettle = Arc::new(StdMutex::new(Kettle::new()));
        let (mut sampler, _engine) = simulated_engine(&kettle);

        assert_eq!(sampler.sample(0), 20);
    }

    #[test]
    fn simulated_boil_completes() {
        let kettle = Arc::new(StdMutex::new(Kettle::new()));
        let (mut sampler, mut engine) = simulated_engine(&kettle);
        engine.tick(sampler.sample(0));
        engine.request_hot(100);

        let mut completed = false;
        for step in 1..=20_000u64 {
            lock_kettle(&kettle).advance(Duration::from_millis(CONTROL_PERIOD_MS));
            let events = engine.tick(sampler.sample(step * CONTROL_PERIOD_MS));
            if events.contains(&HeaterEvent::HotComplete { target: 100 }) {
                completed = true;
                break;
            }
        }

        assert!(completed);
        assert!(!engine.is_heater_on());
        assert!(!lock_kettle(&kettle).heating);
    }

    #[test]
    fn kettle_follows_wall_time_across_a_long_pass() {
        let stepped: SharedKettle = Arc::new(StdMutex::new(Kettle::new()));
        lock_kettle(&stepped).heating = true;
        let mut reference = Kettle::new();
        reference.heating = true;

        let start = Instant::now();
        let mut last_step = start;
        step_kettle(&stepped, &mut last_step, start + Duration::from_secs(5));
        for _ in 0..250 {
            reference.advance(Duration::from_millis(CONTROL_PERIOD_MS));
        }

        let water_c = lock_kettle(&stepped).water_c;
        assert!(water_c > AMBIENT_C + 3.0);
        assert!((water_c - reference.water_c).abs() < 0.05);
        assert_eq!(last_step, start + Duration::from_secs(5));
    }

    #[test]
    fn cooling_water_never_drops_below_ambient() {
        let mut kettle = Kettle::new();
        kettle.water_c = 90.0;
        for _ in 0..100_000 {
            kettle.advance(Duration::from_millis(100));
        }
        assert!(kettle.water_c >= AMBIENT_C);
        assert!(kettle.water_c < 21.0);
    }
}
