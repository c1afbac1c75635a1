use core::{fmt::Debug, num::NonZeroU32};
use std::{
    sync::{Arc, Mutex, OnceLock},
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    http::{client::Client as HttpClient, Headers, Method, Status},
    io::{Read, Write},
    wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    adc::{
        attenuation::DB_11,
        oneshot::{config::AdcChannelConfig, AdcChannelDriver, AdcDriver},
        ADC1,
    },
    delay::BLOCK,
    gpio::{
        AnyIOPin, AnyOutputPin, Gpio34, IOPin, Input, InterruptType, Output, OutputPin, PinDriver,
        Pull,
    },
    modem::Modem,
    prelude::Peripherals,
    task::notification::Notification,
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    http::client::{Configuration as HttpClientConfiguration, EspHttpConnection},
    http::server::{Configuration as HttpConfiguration, EspHttpServer},
    log::EspLogger,
    nvs::{EspDefaultNvsPartition, EspNvs},
    ota::EspOta,
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use teapot_common::{
    config::parse_checkpoint, messages, poll_remote, telegram, AnalogInput, BotConfig,
    BotSession, BotTransport, ButtonMailbox, DeviceVitals, HeaterEvent, HeaterOutput,
    NetworkConfig, OutputError, TeapotConfig, TeapotEngine, TelegramError, TemperatureSampler, Update,
};

const NVS_NAMESPACE: &str = "teapot";
const NVS_BOT_CONFIG_KEY: &str = "bot_config";
const NVS_WIFI_CONFIG_KEY: &str = "wifi_config";
const NVS_CHECKPOINT_KEY: &str = "last_msg_id";
const NVS_BUFFER_BYTES: usize = 1024;
const MAX_HTTP_BODY: usize = 4096;
const MAX_BOT_RESPONSE_BYTES: usize = 16 * 1024;
const OTA_CHUNK_SIZE: usize = 4096;
const HOSTNAME: &str = "Teapot";
const PROVISIONING_AP_SSID: &str = "Teapot-Config";
const WATCHDOG_TIMEOUT_SEC: u32 = 60;
const WIFI_RESTART_GRACE_MS: u64 = 300_000;
const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;
const CONTROL_PERIOD_MS: u64 = 20;
const CONTROL_STACK_BYTES: usize = 20 * 1024;
const BUTTON_STACK_BYTES: usize = 4 * 1024;
const TELEGRAM_TIMEOUT: Duration = Duration::from_secs(10);

const PROVISIONING_INDEX_HTML: &str = r#"<!doctype html>
<html>
<head>
  <meta charset="utf-8">
  <meta name="viewport" content="width=device-width,initial-scale=1">
  <title>Teapot Setup</title>
  <style>
    body{font-family:Arial,sans-serif;max-width:560px;margin:2rem auto;padding:0 1rem;color:#111}
    label{display:block;margin:.6rem 0 .2rem}input{width:100%;padding:.5rem;box-sizing:border-box}
    button{padding:.55rem .9rem;margin-top:1rem}.err{color:#a00000}.ok{color:#106010}
  </style>
</head>
<body>
  <h1>Teapot Setup</h1>
  <label>WiFi SSID</label><input id="wifiSsid" type="text">
  <label>WiFi Password (leave blank to keep current)</label><input id="wifiPass" type="password">
  <label>Telegram Bot Token (leave blank to keep current)</label><input id="botToken" type="password">
  <label>Telegram Chat ID</label><input id="chatId" type="text">
  <button id="save">Save and restart</button>
  <div id="status"></div>
  <script>
    const q=(id)=>document.getElementById(id);
    async function api(path,opt){const r=await fetch(path,opt);let b={};try{b=await r.json();}catch(_){}if(!r.ok)throw new Error(b.error||('Request failed: '+r.status));return b;}
    api('/api/config').then((c)=>{q('wifiSsid').value=c.wifiSsid||'';q('chatId').value=c.chatId||'';}).catch((e)=>{q('status').className='err';q('status').textContent=e.message;});
    q('save').addEventListener('click', async ()=>{
      const body={wifiSsid:q('wifiSsid').value.trim(),chatId:q('chatId').value.trim()};
      if(q('wifiPass').value)body.wifiPass=q('wifiPass').value;
      if(q('botToken').value)body.botToken=q('botToken').value.trim();
      try{await api('/api/config',{method:'PUT',headers:{'Content-Type':'application/json'},body:JSON.stringify(body)});q('status').className='ok';q('status').textContent='Saved, restarting...';}
      catch(e){q('status').className='err';q('status').textContent=e.message;}
    });
  </script>
</body>
</html>
"#;

enum WifiStartup {
    Connected(EspWifi<'static>),
    Provisioning(EspWifi<'static>),
}

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
}

struct StatusLed {
    pin: PinDriver<'static, AnyOutputPin, Output>,
    lit: bool,
}

#[derive(Debug, Serialize)]
struct DeviceConfigView {
    #[serde(rename = "wifiSsid")]
    wifi_ssid: String,
    #[serde(rename = "wifiPassSet")]
    wifi_pass_set: bool,
    #[serde(rename = "botTokenSet")]
    bot_token_set: bool,
    #[serde(rename = "chatId")]
    chat_id: String,
    #[serde(rename = "otaPasswordSet")]
    ota_password_set: bool,
}

#[derive(Debug, Deserialize)]
struct DeviceConfigUpdate {
    #[serde(rename = "wifiSsid")]
    wifi_ssid: String,
    #[serde(rename = "wifiPass", default)]
    wifi_pass: Option<String>,
    #[serde(rename = "botToken", default)]
    bot_token: Option<String>,
    #[serde(rename = "chatId", default)]
    chat_id: Option<String>,
    #[serde(rename = "otaPassword", default)]
    ota_password: Option<String>,
}

#[derive(Debug, Default)]
struct OtaRuntimeState {
    in_progress: bool,
    bytes_written: u64,
    total_bytes: Option<u64>,
    progress_pct: Option<u8>,
    last_error: Option<String>,
    last_sha256: Option<String>,
    last_source_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OtaApplyRequest {
    url: String,
    #[serde(default)]
    sha256: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    reboot: Option<bool>,
}

#[derive(Debug, Serialize)]
struct OtaApplyResponse {
    accepted: bool,
    #[serde(rename = "inProgress")]
    in_progress: bool,
}

#[derive(Debug, Serialize)]
struct OtaStatusResponse {
    supported: bool,
    #[serde(rename = "inProgress")]
    in_progress: bool,
    #[serde(rename = "bytesWritten")]
    bytes_written: u64,
    #[serde(rename = "totalBytes")]
    total_bytes: Option<u64>,
    #[serde(rename = "progressPct")]
    progress_pct: Option<u8>,
    #[serde(rename = "lastError")]
    last_error: Option<String>,
    #[serde(rename = "lastSha256")]
    last_sha256: Option<String>,
    #[serde(rename = "lastSourceUrl")]
    last_source_url: Option<String>,
    #[serde(rename = "runningSlot")]
    running_slot: Option<String>,
}

/// NTC divider on ADC1. Conversions are reduced to 10 bits so the configured
/// divisor keeps its meaning.
struct AdcThermistor {
    channel: AdcChannelDriver<'static, Gpio34, AdcDriver<'static, ADC1>>,
}

impl AdcThermistor {
    fn new(adc: ADC1, pin: Gpio34) -> anyhow::Result<Self> {
        let driver = AdcDriver::new(adc)?;
        let config = AdcChannelConfig {
            attenuation: DB_11,
            ..Default::default()
        };
        let channel = AdcChannelDriver::new(driver, pin, &config)?;
        Ok(Self { channel })
    }
}

impl AnalogInput for AdcThermistor {
    fn read_raw(&mut self) -> Option<u16> {
        match self.channel.read() {
            Ok(raw) => Some(raw >> 2),
            Err(err) => {
                warn!("thermistor conversion failed: {err}");
                None
            }
        }
    }
}

struct GpioHeater {
    pin: PinDriver<'static, AnyOutputPin, Output>,
}

impl GpioHeater {
    fn new(pin: AnyOutputPin) -> anyhow::Result<Self> {
        let mut pin = PinDriver::output(pin)?;
        pin.set_low()?;
        Ok(Self { pin })
    }
}

impl HeaterOutput for GpioHeater {
    fn set_heater(&mut self, on: bool) -> Result<(), OutputError> {
        let result = if on {
            self.pin.set_high()
        } else {
            self.pin.set_low()
        };
        match result {
            Ok(()) => {
                info!("heater relay {}", if on { "on" } else { "off" });
                Ok(())
            }
            Err(err) => {
                warn!("failed to drive heater relay: {err}");
                Err(OutputError(err.to_string()))
            }
        }
    }
}

/// Bot API client over the ESP-IDF HTTP stack. The TLS connection is kept
/// between requests and rebuilt after any failure. Every request feeds the
/// task watchdog first, so one round may span several request timeouts.
struct EspBotTransport {
    token: String,
    client: Option<HttpClient<EspHttpConnection>>,
}

impl EspBotTransport {
    fn new(token: String) -> Self {
        Self {
            token,
            client: None,
        }
    }

    fn client(&mut self) -> Result<&mut HttpClient<EspHttpConnection>, TelegramError> {
        if self.client.is_none() {
            let conf = HttpClientConfiguration {
                timeout: Some(TELEGRAM_TIMEOUT),
                crt_bundle_attach: Some(esp_idf_svc::sys::esp_crt_bundle_attach),
                ..Default::default()
            };
            let connection = EspHttpConnection::new(&conf).map_err(transport_err)?;
            self.client = Some(HttpClient::wrap(connection));
        }
        self.client
            .as_mut()
            .ok_or_else(|| TelegramError::Transport("http client unavailable".to_string()))
    }

    fn get(&mut self, url: &str) -> Result<Vec<u8>, TelegramError> {
        let client = self.client()?;
        let request = client.get(url).map_err(transport_err)?;
        let mut response = request.submit().map_err(transport_err)?;
        read_bot_response(&mut response)
    }

    fn post_json(&mut self, url: &str, body: &[u8]) -> Result<Vec<u8>, TelegramError> {
        let content_length = body.len().to_string();
        let headers = [
            ("Content-Type", "application/json"),
            ("Content-Length", content_length.as_str()),
        ];
        let client = self.client()?;
        let mut request = client.post(url, &headers).map_err(transport_err)?;
        request.write_all(body).map_err(transport_err)?;
        request.flush().map_err(transport_err)?;
        let mut response = request.submit().map_err(transport_err)?;
        read_bot_response(&mut response)
    }

    fn reset_on_error<T>(&mut self, result: Result<T, TelegramError>) -> Result<T, TelegramError> {
        if result.is_err() {
            self.client = None;
        }
        result
    }
}

impl BotTransport for EspBotTransport {
    fn get_updates(&mut self, offset: i64) -> Result<Vec<Update>, TelegramError> {
        feed_watchdog();
        let url = telegram::get_updates_url(&self.token, offset);
        let result = self.get(&url);
        let body = self.reset_on_error(result)?;
        telegram::parse_updates(&body)
    }

    fn send_message(&mut self, chat_id: &str, text: &str) -> Result<(), TelegramError> {
        feed_watchdog();
        let url = telegram::send_message_url(&self.token);
        let body = telegram::send_message_body(chat_id, text)?;
        let result = self.post_json(&url, &body);
        let response = self.reset_on_error(result)?;
        telegram::check_send_response(&response)
    }
}

fn transport_err<E: Debug>(err: E) -> TelegramError {
    TelegramError::Transport(format!("{err:?}"))
}

fn read_bot_response<R>(response: &mut R) -> Result<Vec<u8>, TelegramError>
where
    R: Read + Status,
{
    let status = response.status();
    if !(200..300).contains(&status) {
        return Err(TelegramError::Status(status));
    }

    let mut body = Vec::new();
    let mut chunk = [0_u8; 512];
    loop {
        let read = response.read(&mut chunk).map_err(transport_err)?;
        if read == 0 {
            return Ok(body);
        }
        body.extend_from_slice(&chunk[..read]);
        if body.len() > MAX_BOT_RESPONSE_BYTES {
            return Err(TelegramError::Transport("bot api response too large".to_string()));
        }
    }
}

struct RemoteLink {
    session: BotSession,
    transport: EspBotTransport,
}

impl RemoteLink {
    fn deliver(&mut self, text: &str) {
        if let Err(err) = self.session.notify(&mut self.transport, text) {
            warn!("failed to deliver notification {text:?}: {err}");
        }
    }
}

struct ControlLoop {
    engine: TeapotEngine<GpioHeater>,
    sampler: TemperatureSampler<AdcThermistor>,
    mailbox: Arc<ButtonMailbox>,
    remote: Option<RemoteLink>,
    wifi: EspWifi<'static>,
    status_led: Option<StatusLed>,
    nvs_store: NvsStore,
    config: TeapotConfig,
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let nvs_store = NvsStore {
        partition: nvs_partition.clone(),
        lock: Arc::new(Mutex::new(())),
    };

    let mut config = TeapotConfig::default();
    config.sanitize();

    let mut network = nvs_store.load_network_config().unwrap_or_else(|err| {
        warn!("failed to load wifi config from NVS: {err:#}");
        NetworkConfig::default()
    });
    ensure_wifi_defaults(&mut network);

    let Peripherals {
        modem, pins, adc1, ..
    } = Peripherals::take()?;

    let mut status_led = init_status_led(pins.gpio2.downgrade_output());
    set_status_led(&mut status_led, true);

    let heater = GpioHeater::new(pins.gpio26.downgrade_output())?;
    let engine = TeapotEngine::new(config.clone(), heater);

    let wifi = match connect_wifi(modem, sys_loop, nvs_partition, &network)
        .context("wifi startup failed")?
    {
        WifiStartup::Connected(wifi) => wifi,
        WifiStartup::Provisioning(wifi) => {
            warn!("wifi station unavailable; provisioning AP `{PROVISIONING_AP_SSID}` is up");
            let server = create_provisioning_http_server(nvs_store.clone())?;

            let _wifi = wifi;
            let _server = server;
            thread::sleep(Duration::from_secs(config.provisioning_timeout_sec));
            warn!(
                "no configuration saved within {}s; restarting",
                config.provisioning_timeout_sec
            );
            restart_device();
        }
    };
    disable_wifi_power_save();
    set_status_led(&mut status_led, false);

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;
    if let Ok(mut ota) = EspOta::new() {
        if let Err(err) = ota.mark_running_slot_valid() {
            warn!("failed to mark running OTA slot valid: {err:?}");
        }
    }

    let ota_state = Arc::new(Mutex::new(OtaRuntimeState::default()));
    let server = create_http_server(ota_state, nvs_store.clone())?;

    let sampler = TemperatureSampler::new(AdcThermistor::new(adc1, pins.gpio34)?, &config);
    let mailbox = Arc::new(ButtonMailbox::new(config.long_press_ms));
    spawn_button_watcher(pins.gpio27.downgrade(), mailbox.clone())?;

    let bot = nvs_store.load_bot_config().unwrap_or_else(|err| {
        warn!("failed to load bot config from NVS: {err:#}");
        BotConfig::default()
    });
    let remote_identity = if bot.remote_enabled() {
        let checkpoint = nvs_store.load_checkpoint().unwrap_or_else(|err| {
            warn!("failed to load message checkpoint from NVS: {err:#}");
            None
        });
        info!("telegram remote enabled for chat {} (checkpoint {checkpoint:?})", bot.chat_id);
        Some((bot, checkpoint))
    } else {
        info!("telegram remote disabled: no bot token or chat id configured");
        None
    };

    thread::Builder::new()
        .name("control-loop".into())
        .stack_size(CONTROL_STACK_BYTES)
        .spawn(move || {
            // The TLS client is created on this thread and never leaves it.
            let remote = remote_identity.map(|(bot, checkpoint)| RemoteLink {
                session: BotSession::new(bot.chat_id).resume_from(checkpoint),
                transport: EspBotTransport::new(bot.bot_token),
            });
            let control = ControlLoop {
                engine,
                sampler,
                mailbox,
                remote,
                wifi,
                status_led,
                nvs_store,
                config,
            };
            if let Err(err) = control.run() {
                warn!("control loop failed: {err:#}; restarting");
                restart_device();
            }
        })
        .context("failed to spawn control loop thread")?;

    // Keep the HTTP server alive for the program lifetime.
    let _server = server;
    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

impl ControlLoop {
    fn run(mut self) -> anyhow::Result<()> {
        if let Err(err) = add_current_task_to_watchdog() {
            warn!("failed to register control loop with watchdog: {err:#}");
        }

        if let Some(link) = self.remote.as_mut() {
            link.deliver(&messages::welcome_text(&self.config));
            link.deliver(&messages::ready_text());
        }

        let mut last_poll_ms: Option<u64> = None;
        let mut wifi_down_since_ms: Option<u64> = None;

        loop {
            feed_watchdog();
            let now_ms = monotonic_ms();
            self.supervise_wifi(now_ms, &mut wifi_down_since_ms);

            let temp = self.sampler.sample(now_ms);
            self.engine.observe_temperature(temp);

            if let Some(event) = self.mailbox.take() {
                info!("button {event:?} at {temp} C");
                let events = self.engine.apply_button(event);
                self.announce(&events);
                self.mailbox.rearm();
            }

            let poll_due = last_poll_ms.map_or(true, |last| {
                now_ms.saturating_sub(last) >= self.config.bot_polling_interval_ms
            });
            if self.remote.is_some() && poll_due {
                self.poll_telegram();
                last_poll_ms = Some(monotonic_ms());
            }

            let events = self.engine.tick(temp);
            self.announce(&events);

            thread::sleep(Duration::from_millis(CONTROL_PERIOD_MS));
        }
    }

    fn poll_telegram(&mut self) {
        let vitals = read_vitals(&self.wifi);
        let Some(link) = self.remote.as_mut() else {
            return;
        };

        match poll_remote(&mut link.session, &mut link.transport, &mut self.engine, &vitals) {
            Ok(outcome) => {
                if outcome.failed_replies > 0 {
                    warn!("{} telegram replies failed to send", outcome.failed_replies);
                }
                if outcome.restart {
                    let checkpoint = link.session.last_message_received();
                    if let Err(err) = self.nvs_store.save_checkpoint(checkpoint) {
                        warn!("failed to persist message checkpoint {checkpoint}: {err:#}");
                    }
                    info!("restart requested over telegram");
                    thread::sleep(Duration::from_millis(500));
                    restart_device();
                }
            }
            Err(err) => warn!("telegram poll failed: {err}"),
        }
    }

    fn announce(&mut self, events: &[HeaterEvent]) {
        for event in events {
            let text = messages::event_text(event);
            info!("{text}");
            if let Some(link) = self.remote.as_mut() {
                link.deliver(&text);
            }
        }
    }

    fn supervise_wifi(&mut self, now_ms: u64, down_since_ms: &mut Option<u64>) {
        let connected = is_wifi_station_connected();
        set_status_led(&mut self.status_led, !connected);

        if connected {
            *down_since_ms = None;
        } else if let Some(since) = *down_since_ms {
            if now_ms.saturating_sub(since) >= WIFI_RESTART_GRACE_MS {
                warn!(
                    "wifi disconnected for {}s; restarting device for recovery",
                    WIFI_RESTART_GRACE_MS / 1000
                );
                thread::sleep(Duration::from_millis(100));
                restart_device();
            }
        } else {
            *down_since_ms = Some(now_ms);
        }
    }
}

fn spawn_button_watcher(pin: AnyIOPin, mailbox: Arc<ButtonMailbox>) -> anyhow::Result<()> {
    let mut button = PinDriver::input(pin)?;
    button.set_pull(Pull::Up)?;
    button.set_interrupt_type(InterruptType::AnyEdge)?;

    thread::Builder::new()
        .name("button-irq".into())
        .stack_size(BUTTON_STACK_BYTES)
        .spawn(move || {
            if let Err(err) = watch_button(button, mailbox) {
                warn!("button watcher stopped: {err:#}");
            }
        })
        .context("failed to spawn button thread")?;
    Ok(())
}

/// The driver disables the edge interrupt after every trigger. This thread
/// re-enables it as soon as the ISR signals, independent of the control loop,
/// then checks the level for an edge that arrived in between.
fn watch_button(
    mut button: PinDriver<'static, AnyIOPin, Input>,
    mailbox: Arc<ButtonMailbox>,
) -> anyhow::Result<()> {
    let notification = Notification::new();
    let notifier = notification.notifier();
    let gpio = button.pin();
    let isr_mailbox = mailbox.clone();

    // SAFETY: the callback runs in interrupt context and only reads the pin
    // level, the timer and the mailbox atomics, then notifies this task.
    unsafe {
        button.subscribe(move || {
            let level_high = esp_idf_svc::sys::gpio_get_level(gpio) != 0;
            isr_mailbox.on_edge(level_high, isr_clock_ms());
            notifier.notify_and_yield(NonZeroU32::MIN);
        })?;
    }

    loop {
        button.enable_interrupt()?;
        mailbox.resync(button.is_high(), isr_clock_ms());
        notification.wait(BLOCK);
    }
}

fn ensure_wifi_defaults(network: &mut NetworkConfig) {
    if network.wifi_ssid.is_empty() {
        if let Some(ssid) = option_env!("WIFI_SSID") {
            network.wifi_ssid = ssid.to_string();
        }
    }

    if network.wifi_pass.is_empty() {
        if let Some(pass) = option_env!("WIFI_PASS") {
            network.wifi_pass = pass.to_string();
        }
    }
}

fn create_http_server(
    ota_state: Arc<Mutex<OtaRuntimeState>>,
    nvs_store: NvsStore,
) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 16 * 1024,
        ..Default::default()
    };
    let mut server = EspHttpServer::new(&conf)?;

    register_config_handlers(&mut server, &nvs_store, false)?;

    {
        let ota_state = ota_state.clone();
        server.fn_handler("/api/ota/status", Method::Get, move |req| {
            let payload = build_ota_status_response(&ota_state);
            write_json(req, &payload)
        })?;
    }

    {
        let ota_state = ota_state.clone();
        let nvs_store = nvs_store.clone();
        server.fn_handler::<anyhow::Error, _>("/api/ota/apply", Method::Post, move |mut req| {
            let body = read_request_body(&mut req)?;
            let update: OtaApplyRequest =
                serde_json::from_slice(&body).context("invalid ota payload")?;

            if let Err(message) = validate_ota_apply_request(&update) {
                return write_error(req, 400, message);
            }

            match apply_ota_update(&ota_state, &nvs_store, update) {
                Ok(payload) => write_json(req, &payload),
                Err(err) => {
                    let message = err.to_string();
                    if message.contains("invalid OTA password") {
                        write_error(req, 403, &message)
                    } else if message.contains("already in progress") {
                        write_error(req, 409, &message)
                    } else {
                        write_error(req, 500, "Failed to start OTA apply")
                    }
                }
            }
        })?;
    }

    server.fn_handler("/api/restart", Method::Post, move |req| {
        spawn_delayed_restart(Duration::from_millis(500))?;
        write_json(req, &serde_json::json!({ "restarting": true }))
    })?;

    Ok(server)
}

fn create_provisioning_http_server(nvs_store: NvsStore) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 16 * 1024,
        ..Default::default()
    };
    let mut server = EspHttpServer::new(&conf)?;

    for path in [
        "/",
        "/generate_204",
        "/gen_204",
        "/hotspot-detect.html",
        "/connecttest.txt",
        "/ncsi.txt",
    ] {
        server.fn_handler::<anyhow::Error, _>(path, Method::Get, move |req| {
            req.into_ok_response()?
                .write_all(PROVISIONING_INDEX_HTML.as_bytes())?;
            Ok(())
        })?;
    }

    register_config_handlers(&mut server, &nvs_store, true)?;

    server.fn_handler("/api/ota/apply", Method::Post, move |req| {
        write_error(req, 409, "Connect station WiFi before applying OTA updates")
    })?;

    Ok(server)
}

fn register_config_handlers(
    server: &mut EspHttpServer<'static>,
    nvs_store: &NvsStore,
    restart_on_save: bool,
) -> anyhow::Result<()> {
    {
        let nvs_store = nvs_store.clone();
        server.fn_handler("/api/config", Method::Get, move |req| {
            let network = nvs_store.load_network_config().unwrap_or_default();
            let bot = nvs_store.load_bot_config().unwrap_or_default();
            write_json(req, &build_config_view(&network, &bot))
        })?;
    }

    {
        let nvs_store = nvs_store.clone();
        server.fn_handler::<anyhow::Error, _>("/api/config", Method::Put, move |mut req| {
            let body = read_request_body(&mut req)?;
            let update: DeviceConfigUpdate =
                serde_json::from_slice(&body).context("invalid config payload")?;

            if let Err(message) = validate_config_update(&update) {
                return write_error(req, 400, message);
            }

            let payload = apply_config_update(&nvs_store, update)?;
            if restart_on_save {
                spawn_delayed_restart(Duration::from_secs(3))?;
            }
            write_json(req, &payload)
        })?;
    }

    Ok(())
}

fn read_request_body(
    req: &mut esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
) -> anyhow::Result<Vec<u8>> {
    let len = req.content_len().unwrap_or(0) as usize;
    if len > MAX_HTTP_BODY {
        return Err(anyhow!("request body too large"));
    }

    let mut body = vec![0_u8; len];
    if len > 0 {
        req.read_exact(&mut body)?;
    }
    Ok(body)
}

fn write_json<T: Serialize>(
    req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    payload: &T,
) -> anyhow::Result<()> {
    let body = serde_json::to_vec(payload)?;
    req.into_response(
        200,
        Some("OK"),
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn write_error(
    req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    status_code: u16,
    message: &str,
) -> anyhow::Result<()> {
    let body = serde_json::to_vec(&serde_json::json!({ "error": message }))?;
    req.into_response(
        status_code,
        None,
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    network: &NetworkConfig,
) -> anyhow::Result<WifiStartup> {
    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    if let Err(err) = esp_wifi.sta_netif_mut().set_hostname(HOSTNAME) {
        warn!("failed to set hostname `{HOSTNAME}`: {err}");
    }

    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

    if !network.has_station_credentials() {
        warn!("wifi credentials missing; entering provisioning AP mode");
        start_provisioning_ap(&mut wifi)?;
        return Ok(WifiStartup::Provisioning(esp_wifi));
    }

    let auth_method = if network.wifi_pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: network
            .wifi_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: network
            .wifi_pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{}`", network.wifi_ssid);

    let mut last_err = None;
    for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                info!("wifi connected on attempt {attempt}");
                last_err = None;
                break;
            }
            Err(err) => {
                warn!("wifi attempt {attempt}/{WIFI_CONNECT_ATTEMPTS} failed: {err:#}");
                last_err = Some(err);
            }
        }

        if attempt < WIFI_CONNECT_ATTEMPTS {
            let _ = wifi.disconnect();
            thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
        }
    }

    match last_err {
        None => Ok(WifiStartup::Connected(esp_wifi)),
        Some(err) => {
            warn!("all {WIFI_CONNECT_ATTEMPTS} wifi connect attempts failed; last error: {err:#}");
            let _ = wifi.disconnect();
            let _ = wifi.stop();
            start_provisioning_ap(&mut wifi)?;
            Ok(WifiStartup::Provisioning(esp_wifi))
        }
    }
}

fn start_provisioning_ap(wifi: &mut BlockingWifi<&mut EspWifi<'static>>) -> anyhow::Result<()> {
    wifi.set_configuration(&Configuration::AccessPoint(AccessPointConfiguration {
        ssid: PROVISIONING_AP_SSID
            .try_into()
            .map_err(|_| anyhow!("provisioning AP SSID too long"))?,
        auth_method: AuthMethod::None,
        channel: 1,
        ..Default::default()
    }))?;
    wifi.start()?;
    wifi.wait_netif_up()?;
    info!("provisioning AP started on `{PROVISIONING_AP_SSID}`");
    Ok(())
}

fn validate_config_update(update: &DeviceConfigUpdate) -> Result<(), &'static str> {
    let ssid = update.wifi_ssid.trim();
    if ssid.is_empty() {
        return Err("wifiSsid cannot be empty");
    }
    if ssid.len() > 32 {
        return Err("wifiSsid must be at most 32 bytes");
    }
    if update.wifi_pass.as_deref().is_some_and(|pass| pass.len() > 64) {
        return Err("wifiPass must be at most 64 bytes");
    }
    Ok(())
}

fn apply_config_update(
    nvs_store: &NvsStore,
    update: DeviceConfigUpdate,
) -> anyhow::Result<DeviceConfigView> {
    let mut network = nvs_store.load_network_config().unwrap_or_default();
    network.wifi_ssid = update.wifi_ssid.trim().to_string();
    if let Some(pass) = update.wifi_pass {
        network.wifi_pass = pass;
    }
    if let Some(ota_password) = update.ota_password {
        network.ota_password = ota_password;
    }

    let mut bot = nvs_store.load_bot_config().unwrap_or_default();
    if let Some(token) = update.bot_token {
        bot.bot_token = token;
    }
    if let Some(chat_id) = update.chat_id {
        bot.chat_id = chat_id;
    }
    bot.sanitize();

    nvs_store.save_network_config(&network)?;
    nvs_store.save_bot_config(&bot)?;
    info!(
        "config saved: ssid=`{}`, remote enabled={}",
        network.wifi_ssid,
        bot.remote_enabled()
    );

    Ok(build_config_view(&network, &bot))
}

fn build_config_view(network: &NetworkConfig, bot: &BotConfig) -> DeviceConfigView {
    DeviceConfigView {
        wifi_ssid: network.wifi_ssid.clone(),
        wifi_pass_set: !network.wifi_pass.is_empty(),
        bot_token_set: !bot.bot_token.is_empty(),
        chat_id: bot.chat_id.clone(),
        ota_password_set: !network.ota_password.is_empty(),
    }
}

fn validate_ota_apply_request(update: &OtaApplyRequest) -> Result<(), &'static str> {
    let url = update.url.trim();
    if url.is_empty() {
        return Err("url cannot be empty");
    }
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err("url must start with http:// or https://");
    }

    if let Some(sha256) = update.sha256.as_ref() {
        let value = sha256.trim();
        if value.len() != 64 || !value.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err("sha256 must be 64 hex characters");
        }
    }

    Ok(())
}

fn apply_ota_update(
    ota_state: &Arc<Mutex<OtaRuntimeState>>,
    nvs_store: &NvsStore,
    update: OtaApplyRequest,
) -> anyhow::Result<OtaApplyResponse> {
    let network = nvs_store.load_network_config().unwrap_or_default();
    if !network.ota_password.is_empty() {
        let supplied = update.password.as_deref().unwrap_or_default();
        if supplied != network.ota_password {
            return Err(anyhow!("invalid OTA password"));
        }
    }

    {
        let mut ota = ota_state.lock().unwrap();
        if ota.in_progress {
            return Err(anyhow!("OTA update already in progress"));
        }
        *ota = OtaRuntimeState {
            in_progress: true,
            last_source_url: Some(update.url.clone()),
            ..OtaRuntimeState::default()
        };
    }

    let worker_state = ota_state.clone();
    let spawn_result = thread::Builder::new()
        .name("ota-apply".into())
        .stack_size(16 * 1024)
        .spawn(move || {
            let reboot_after_apply = update.reboot.unwrap_or(true);
            let expected_sha = update
                .sha256
                .as_ref()
                .map(|value| value.trim().to_ascii_lowercase());

            match download_and_apply_ota(&worker_state, &update.url, expected_sha.as_deref()) {
                Ok((bytes_written, digest_hex)) => {
                    {
                        let mut ota = worker_state.lock().unwrap();
                        ota.in_progress = false;
                        ota.bytes_written = bytes_written;
                        ota.progress_pct = Some(100);
                        ota.last_sha256 = Some(digest_hex);
                    }
                    info!("OTA apply completed ({bytes_written} bytes)");

                    if reboot_after_apply {
                        thread::sleep(Duration::from_millis(800));
                        restart_device();
                    }
                }
                Err(err) => {
                    warn!("OTA apply failed: {err:#}");
                    let mut ota = worker_state.lock().unwrap();
                    ota.in_progress = false;
                    ota.last_error = Some(err.to_string());
                }
            }
        });

    if let Err(err) = spawn_result {
        let message = format!("failed to spawn OTA apply thread: {err}");
        let mut ota = ota_state.lock().unwrap();
        ota.in_progress = false;
        ota.last_error = Some(message.clone());
        return Err(anyhow!("{message}"));
    }

    Ok(OtaApplyResponse {
        accepted: true,
        in_progress: true,
    })
}

fn download_and_apply_ota(
    ota_state: &Arc<Mutex<OtaRuntimeState>>,
    url: &str,
    expected_sha256: Option<&str>,
) -> anyhow::Result<(u64, String)> {
    let http_conf = HttpClientConfiguration {
        timeout: Some(Duration::from_secs(30)),
        crt_bundle_attach: Some(esp_idf_svc::sys::esp_crt_bundle_attach),
        ..Default::default()
    };
    let mut client = HttpClient::wrap(EspHttpConnection::new(&http_conf)?);
    let request = client.request(Method::Get, url, &[])?;
    let mut response = request.submit().map_err(|e| anyhow!("{e:?}"))?;

    let status = response.status();
    if !(200..300).contains(&status) {
        return Err(anyhow!("OTA download failed with HTTP {status}"));
    }

    ota_state.lock().unwrap().total_bytes = response
        .header("Content-Length")
        .and_then(|value| value.parse::<u64>().ok());

    let mut ota = EspOta::new().map_err(|err| anyhow!("failed to acquire OTA: {err:?}"))?;
    let mut update = ota
        .initiate_update()
        .map_err(|err| anyhow!("failed to initiate OTA update: {err:?}"))?;

    let mut hasher = Sha256::new();
    let mut total_written = 0_u64;
    let mut chunk = [0_u8; OTA_CHUNK_SIZE];

    loop {
        let read = response.read(&mut chunk).map_err(|e| anyhow!("{e:?}"))?;
        if read == 0 {
            break;
        }

        update
            .write(&chunk[..read])
            .map_err(|err| anyhow!("failed writing OTA data: {err:?}"))?;
        hasher.update(&chunk[..read]);
        total_written = total_written.saturating_add(read as u64);

        let mut state = ota_state.lock().unwrap();
        state.bytes_written = total_written;
        if let Some(total) = state.total_bytes.filter(|value| *value > 0) {
            let pct = (total_written.saturating_mul(100) / total).min(100);
            state.progress_pct = Some(pct as u8);
        }
    }

    if total_written == 0 {
        return Err(anyhow!("OTA download body is empty"));
    }

    let digest_hex: String = hasher
        .finalize()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect();

    if let Some(expected) = expected_sha256 {
        if digest_hex != expected {
            return Err(anyhow!(
                "sha256 mismatch (expected {expected}, got {digest_hex})"
            ));
        }
    }

    update
        .complete()
        .map_err(|err| anyhow!("failed finalizing OTA image: {err:?}"))?;

    Ok((total_written, digest_hex))
}

fn build_ota_status_response(ota_state: &Arc<Mutex<OtaRuntimeState>>) -> OtaStatusResponse {
    let ota = ota_state.lock().unwrap();
    let running_slot = EspOta::new()
        .ok()
        .and_then(|ota| ota.get_running_slot().ok())
        .map(|slot| slot.label.as_str().to_string());

    OtaStatusResponse {
        supported: true,
        in_progress: ota.in_progress,
        bytes_written: ota.bytes_written,
        total_bytes: ota.total_bytes,
        progress_pct: ota.progress_pct,
        last_error: ota.last_error.clone(),
        last_sha256: ota.last_sha256.clone(),
        last_source_url: ota.last_source_url.clone(),
        running_slot,
    }
}

impl NvsStore {
    fn read_str(&self, key: &str) -> anyhow::Result<Option<String>> {
        let _guard = self.lock.lock().unwrap();
        let nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; NVS_BUFFER_BYTES];
        Ok(nvs.get_str(key, &mut buffer)?.map(str::to_string))
    }

    fn write_str(&self, key: &str, value: &str) -> anyhow::Result<()> {
        let _guard = self.lock.lock().unwrap();
        let mut nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        nvs.set_str(key, value)?;
        Ok(())
    }

    fn load_bot_config(&self) -> anyhow::Result<BotConfig> {
        match self.read_str(NVS_BOT_CONFIG_KEY)? {
            Some(raw) => Ok(BotConfig::from_json(raw.as_bytes())?),
            None => Ok(BotConfig::default()),
        }
    }

    fn save_bot_config(&self, bot: &BotConfig) -> anyhow::Result<()> {
        self.write_str(NVS_BOT_CONFIG_KEY, &bot.to_json()?)
    }

    fn load_network_config(&self) -> anyhow::Result<NetworkConfig> {
        match self.read_str(NVS_WIFI_CONFIG_KEY)? {
            Some(raw) => Ok(serde_json::from_str::<NetworkConfig>(&raw)?),
            None => Ok(NetworkConfig::default()),
        }
    }

    fn save_network_config(&self, network: &NetworkConfig) -> anyhow::Result<()> {
        self.write_str(NVS_WIFI_CONFIG_KEY, &serde_json::to_string(network)?)
    }

    fn load_checkpoint(&self) -> anyhow::Result<Option<i64>> {
        Ok(self
            .read_str(NVS_CHECKPOINT_KEY)?
            .and_then(|raw| parse_checkpoint(&raw)))
    }

    fn save_checkpoint(&self, last_message_id: i64) -> anyhow::Result<()> {
        self.write_str(NVS_CHECKPOINT_KEY, &last_message_id.to_string())
    }
}

fn read_vitals(wifi: &EspWifi<'static>) -> DeviceVitals {
    let ip = wifi
        .sta_netif()
        .get_ip_info()
        .map(|info| info.ip.to_string())
        .unwrap_or_default();

    let mut ap_info = esp_idf_svc::sys::wifi_ap_record_t::default();
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_sta_get_ap_info(&mut ap_info) };
    let rssi_dbm = if rc == esp_idf_svc::sys::ESP_OK {
        i32::from(ap_info.rssi)
    } else {
        0
    };

    DeviceVitals {
        ip,
        rssi_dbm,
        free_heap_bytes: unsafe { esp_idf_svc::sys::esp_get_free_heap_size() },
    }
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
}

fn disable_wifi_power_save() {
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_set_ps(0) };
    if rc != esp_idf_svc::sys::ESP_OK {
        warn!("failed to disable wifi power save: esp_err_t={rc}");
    }
}

fn is_wifi_station_connected() -> bool {
    let mut ap_info = esp_idf_svc::sys::wifi_ap_record_t::default();
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_sta_get_ap_info(&mut ap_info) };
    rc == esp_idf_svc::sys::ESP_OK
}

fn init_status_led(pin: AnyOutputPin) -> Option<StatusLed> {
    match PinDriver::output(pin) {
        Ok(pin) => Some(StatusLed { pin, lit: false }),
        Err(err) => {
            warn!("status LED unavailable: {err}");
            None
        }
    }
}

/// Lit while the device is configuring or offline.
fn set_status_led(status_led: &mut Option<StatusLed>, lit: bool) {
    let Some(led) = status_led.as_mut() else {
        return;
    };
    if led.lit == lit {
        return;
    }

    let result = if lit {
        led.pin.set_high()
    } else {
        led.pin.set_low()
    };
    match result {
        Ok(()) => led.lit = lit,
        Err(err) => warn!("failed to drive status LED: {err}"),
    }
}

fn spawn_delayed_restart(delay: Duration) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("restart-request".into())
        .spawn(move || {
            thread::sleep(delay);
            restart_device();
        })
        .context("failed to spawn restart thread")?;
    Ok(())
}

fn restart_device() -> ! {
    unsafe { esp_idf_svc::sys::esp_restart() };
    #[allow(unreachable_code)]
    loop {
        thread::sleep(Duration::from_secs(1));
    }
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

/// Wrapping millisecond clock that is safe to read from interrupt context.
fn isr_clock_ms() -> u32 {
    (unsafe { esp_idf_svc::sys::esp_timer_get_time() } / 1000) as u32
}
