use core::convert::TryInto;
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        mpsc::{self, Receiver},
        Arc, Mutex, OnceLock,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use dht_sensor::dht22;
use embedded_svc::{
    http::Method,
    io::{Read, Write},
    mqtt::client::{Details, EventPayload, QoS},
    wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    delay::{Ets, TickType},
    gpio::{AnyIOPin, AnyOutputPin, InputOutput, Output, PinDriver, Pull},
    i2c::{I2cConfig, I2cDriver},
    units::FromValueType,
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    http::server::{Configuration as HttpConfiguration, EspHttpServer},
    log::EspLogger,
    mqtt::client::{EspMqttClient, EspMqttConnection, MqttClientConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs},
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};
use serde::{Deserialize, Serialize};

use monitor_common::{
    command::MAX_COMMAND_PAYLOAD_BYTES,
    config::NetworkConfig,
    sensor::{validate_climate, validate_lux},
    ClimateSample, Clock, EnvironmentSensors, InboundMessage, MonitorNode, RuntimeConfig,
    SensorError, Stepper, TopicScheme, Transport, TransportError,
};

const NVS_NAMESPACE: &str = "roommonitor";
const NVS_RUNTIME_KEY: &str = "runtime_json";

const PROVISIONING_AP_SSID: &str = "RoomMonitor-Setup";
const PROVISIONING_AP_PASSWORD: &str = "monitorsetup";
const MAX_HTTP_BODY: usize = 2048;
const WATCHDOG_TIMEOUT_SEC: u32 = 60;
const WIFI_RESTART_GRACE_MS: u64 = 300_000;
const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 500;
const MQTT_CONNECT_WAIT_MS: u64 = 3_000;

const BH1750_POWER_ON: u8 = 0x01;
const BH1750_CONTINUOUS_HIGH_RES: u8 = 0x10;
const BH1750_COUNTS_PER_LUX: f32 = 1.2;
const I2C_TIMEOUT_MS: u64 = 100;

const PORTAL_HTML: &str = r#"<!doctype html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <meta name="viewport" content="width=device-width, initial-scale=1">
  <title>Room Monitor Setup</title>
  <style>
    body{font-family:Arial,sans-serif;max-width:560px;margin:2rem auto;padding:0 1rem;color:#111}
    label{display:block;margin:.5rem 0 .2rem}
    input{width:100%;padding:.5rem;box-sizing:border-box}
    button{padding:.55rem .9rem;margin-top:.8rem}
    .muted{color:#555}.ok{color:#106010}.err{color:#a00000}
  </style>
</head>
<body>
  <h1>Room Monitor Setup</h1>
  <label>WiFi SSID</label><input id="wifiSsid" type="text">
  <label>WiFi Password (leave blank to keep current)</label><input id="wifiPass" type="password">
  <label>MQTT Server</label><input id="mqttHost" type="text" placeholder="192.168.0.10">
  <label>MQTT Port</label><input id="mqttPort" type="number" min="1" max="65535">
  <label>MQTT Username</label><input id="mqttUser" type="text">
  <label>MQTT Password (leave blank to keep current)</label><input id="mqttPass" type="password">
  <label>Owner</label><input id="owner" type="text" placeholder="jihoon">
  <label>Room (optional)</label><input id="room" type="text">
  <button id="save">Save</button>
  <button id="restart">Restart Device</button>
  <p id="status" class="muted"></p>
  <script>
    const q=(id)=>document.getElementById(id);
    async function api(path,opt){
      const r=await fetch(path,opt);let b={};
      try{b=await r.json();}catch(_){}
      if(!r.ok)throw new Error(b.error||('Request failed: '+r.status));
      return b;
    }
    api('/api/network').then(n=>{
      q('wifiSsid').value=n.wifiSsid||'';
      q('mqttHost').value=n.mqttHost||'';
      q('mqttPort').value=n.mqttPort||1883;
      q('mqttUser').value=n.mqttUser||'';
      q('owner').value=n.owner||'';
      q('room').value=n.room||'';
    }).catch(err=>{q('status').className='err';q('status').textContent=err.message;});
    q('save').addEventListener('click', async ()=>{
      try{
        const payload={
          wifiSsid:q('wifiSsid').value.trim(),
          wifiPass:q('wifiPass').value||undefined,
          mqttHost:q('mqttHost').value.trim(),
          mqttPort:Number(q('mqttPort').value||1883),
          mqttUser:q('mqttUser').value.trim(),
          mqttPass:q('mqttPass').value||undefined,
          owner:q('owner').value.trim(),
          room:q('room').value.trim()||null,
        };
        await api('/api/network',{method:'PUT',headers:{'content-type':'application/json'},body:JSON.stringify(payload)});
        q('status').className='ok'; q('status').textContent='Saved. Restart to apply.';
      }catch(err){q('status').className='err'; q('status').textContent=err.message;}
    });
    q('restart').addEventListener('click', ()=>api('/api/restart',{method:'POST'})
      .then(()=>{q('status').className='ok';q('status').textContent='Restarting...';})
      .catch(err=>{q('status').className='err';q('status').textContent=err.message;}));
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

#[derive(Debug, Serialize)]
struct NetworkConfigView {
    #[serde(rename = "wifiSsid")]
    wifi_ssid: String,
    #[serde(rename = "wifiPassSet")]
    wifi_pass_set: bool,
    #[serde(rename = "mqttHost")]
    mqtt_host: String,
    #[serde(rename = "mqttPort")]
    mqtt_port: u16,
    #[serde(rename = "mqttUser")]
    mqtt_user: String,
    #[serde(rename = "mqttPassSet")]
    mqtt_pass_set: bool,
    owner: String,
    room: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NetworkConfigUpdate {
    #[serde(rename = "wifiSsid")]
    wifi_ssid: String,
    #[serde(rename = "wifiPass", default)]
    wifi_pass: Option<String>,
    #[serde(rename = "mqttHost")]
    mqtt_host: String,
    #[serde(rename = "mqttPort")]
    mqtt_port: u16,
    #[serde(rename = "mqttUser", default)]
    mqtt_user: String,
    #[serde(rename = "mqttPass", default)]
    mqtt_pass: Option<String>,
    #[serde(default)]
    owner: Option<String>,
    #[serde(default)]
    room: Option<String>,
}

struct Bh1750 {
    i2c: I2cDriver<'static>,
    address: u8,
    ready: bool,
}

impl Bh1750 {
    fn init(&mut self) -> bool {
        let timeout = TickType::new_millis(I2C_TIMEOUT_MS).ticks();
        let result = self
            .i2c
            .write(self.address, &[BH1750_POWER_ON], timeout)
            .and_then(|_| {
                self.i2c
                    .write(self.address, &[BH1750_CONTINUOUS_HIGH_RES], timeout)
            });

        self.ready = match result {
            Ok(()) => {
                info!("[BH1750] Sensor initialized at {:#04x}", self.address);
                true
            }
            Err(err) => {
                warn!(
                    "[BH1750] Sensor initialization failed at {:#04x}: {err:?}. Check wiring or I2C address.",
                    self.address
                );
                false
            }
        };
        self.ready
    }

    fn read_lux(&mut self) -> Result<f32, SensorError> {
        if !self.ready && !self.init() {
            return Err(SensorError::Bus("BH1750 not initialized".to_string()));
        }

        let mut raw = [0_u8; 2];
        let timeout = TickType::new_millis(I2C_TIMEOUT_MS).ticks();
        if let Err(err) = self.i2c.read(self.address, &mut raw, timeout) {
            self.ready = false;
            return Err(SensorError::Bus(format!("BH1750 read failed: {err:?}")));
        }
        Ok(u16::from_be_bytes(raw) as f32 / BH1750_COUNTS_PER_LUX)
    }
}

struct SensorSuite {
    dht_pin: PinDriver<'static, AnyIOPin, InputOutput>,
    light: Bh1750,
    delay: Ets,
}

impl SensorSuite {
    fn new(runtime: &RuntimeConfig, i2c0: esp_idf_hal::i2c::I2C0) -> anyhow::Result<Self> {
        let hardware = &runtime.hardware;

        let mut dht_pin = PinDriver::input_output_od(unsafe { AnyIOPin::new(hardware.dht_pin) })?;
        dht_pin.set_pull(Pull::Up)?;
        dht_pin.set_high()?;

        let i2c_config = I2cConfig::new().baudrate(100.kHz().into());
        let i2c = I2cDriver::new(
            i2c0,
            unsafe { AnyIOPin::new(hardware.i2c_sda_pin) },
            unsafe { AnyIOPin::new(hardware.i2c_scl_pin) },
            &i2c_config,
        )
        .context("failed to initialize I2C bus")?;

        let mut light = Bh1750 {
            i2c,
            address: hardware.bh1750_address,
            ready: false,
        };
        light.init();

        Ok(Self {
            dht_pin,
            light,
            delay: Ets,
        })
    }
}

impl EnvironmentSensors for SensorSuite {
    fn read_temperature_humidity(&mut self) -> Result<ClimateSample, SensorError> {
        self.dht_pin
            .set_high()
            .map_err(|err| SensorError::Bus(format!("DHT22 line: {err:?}")))?;

        let reading = dht22::blocking::read(&mut self.delay, &mut self.dht_pin)
            .map_err(|err| SensorError::Bus(format!("DHT22 read failed: {err:?}")))?;
        validate_climate(reading.temperature, reading.relative_humidity)
    }

    fn read_light(&mut self) -> Result<f32, SensorError> {
        self.light.read_lux().and_then(validate_lux)
    }
}

struct EspTransport {
    client: EspMqttClient<'static>,
    inbox: Receiver<InboundMessage>,
    connected: Arc<AtomicBool>,
    sessions: Arc<AtomicU64>,
}

impl EspTransport {
    fn new(network: &NetworkConfig) -> anyhow::Result<Self> {
        let (client, conn) = create_mqtt_client(network)?;
        let (tx, inbox) = mpsc::channel();
        let connected = Arc::new(AtomicBool::new(false));
        let sessions = Arc::new(AtomicU64::new(0));
        spawn_mqtt_receiver(conn, tx, connected.clone(), sessions.clone())?;

        Ok(Self {
            client,
            inbox,
            connected,
            sessions,
        })
    }
}

impl Transport for EspTransport {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn session(&self) -> u64 {
        self.sessions.load(Ordering::Relaxed)
    }

    // esp-mqtt reconnects by itself; this only waits for the Connected event.
    fn connect(&mut self) -> Result<(), TransportError> {
        let deadline = Instant::now() + Duration::from_millis(MQTT_CONNECT_WAIT_MS);
        while Instant::now() < deadline {
            if self.is_connected() {
                return Ok(());
            }
            feed_watchdog();
            thread::sleep(Duration::from_millis(50));
        }
        Err(TransportError::Disconnected)
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        self.client
            .subscribe(topic, QoS::AtMostOnce)
            .map(|_| ())
            .map_err(|err| TransportError::Subscribe {
                topic: topic.to_string(),
                reason: format!("{err:?}"),
            })
    }

    fn publish(&mut self, topic: &str, payload: &str) -> Result<(), TransportError> {
        self.client
            .publish(topic, QoS::AtMostOnce, false, payload.as_bytes())
            .map(|_| ())
            .map_err(|err| TransportError::Publish {
                topic: topic.to_string(),
                reason: format!("{err:?}"),
            })
    }

    fn poll(&mut self) -> Vec<InboundMessage> {
        self.inbox.try_iter().collect()
    }
}

struct EspClock;

impl Clock for EspClock {
    fn now_ms(&self) -> u64 {
        monotonic_ms()
    }

    fn sleep_ms(&mut self, ms: u64) {
        // Reconnect delays can exceed the watchdog timeout.
        let mut remaining = ms;
        while remaining > 0 {
            feed_watchdog();
            let chunk = remaining.min(1_000);
            thread::sleep(Duration::from_millis(chunk));
            remaining -= chunk;
        }
    }
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

    let mut runtime = nvs_store.load_runtime_config().unwrap_or_else(|err| {
        warn!("failed to load runtime config from NVS: {err:#}");
        RuntimeConfig::default()
    });
    ensure_wifi_defaults(&mut runtime);
    runtime.sanitize();
    info!(
        "NVS config loaded: ssid=`{}`, mqtt=`{}:{}`, owner=`{}`",
        runtime.network.wifi_ssid,
        runtime.network.mqtt_host,
        runtime.network.mqtt_port,
        runtime.topics.owner
    );

    let Peripherals { modem, i2c0, .. } = Peripherals::take()?;

    let sensors =
        SensorSuite::new(&runtime, i2c0).context("failed to initialize sensor suite")?;

    let wifi = match connect_wifi(modem, sys_loop, nvs_partition, &runtime.network)
        .context("wifi startup failed")?
    {
        WifiStartup::Connected(wifi) => {
            info!("wifi connected");
            wifi
        }
        WifiStartup::Provisioning(wifi) => {
            warn!(
                "wifi station connection unavailable; starting provisioning AP `{}`",
                PROVISIONING_AP_SSID
            );
            let server = create_portal_http_server(nvs_store.clone(), true)?;
            let _wifi = wifi;
            let _server = server;
            loop {
                thread::sleep(Duration::from_secs(60));
            }
        }
    };
    disable_wifi_power_save();

    if let Err(err) = runtime.validate() {
        warn!("{err}; configure the broker from the setup page on the station address");
        let server = create_portal_http_server(nvs_store.clone(), false)?;
        let _wifi = wifi;
        let _server = server;
        loop {
            thread::sleep(Duration::from_secs(60));
        }
    }

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;
    add_current_task_to_watchdog()?;

    let transport = EspTransport::new(&runtime.network)?;
    let stepper = Stepper::new(
        stepper_coils(runtime.hardware.stepper_pins)?,
        Ets,
        runtime.node.step_period_ms,
        runtime.node.pump_every_steps,
    );

    let mut node = MonitorNode::new(&runtime, transport, sensors, stepper, EspClock);
    info!(
        "monitor node running; commands on `{}`",
        node.topics().control
    );

    // Keep services alive for the program lifetime.
    let _wifi = wifi;
    let mut wifi_disconnected_since: Option<Instant> = None;

    node.run(|_| {
        feed_watchdog();
        maintain_wifi_health(&mut wifi_disconnected_since);
    })?;
    Ok(())
}

fn stepper_coils(pins: [i32; 4]) -> anyhow::Result<[PinDriver<'static, AnyOutputPin, Output>; 4]> {
    let [in1, in2, in3, in4] = pins;
    let mut coils = [
        PinDriver::output(unsafe { AnyOutputPin::new(in1) })?,
        PinDriver::output(unsafe { AnyOutputPin::new(in2) })?,
        PinDriver::output(unsafe { AnyOutputPin::new(in3) })?,
        PinDriver::output(unsafe { AnyOutputPin::new(in4) })?,
    ];
    for coil in coils.iter_mut() {
        coil.set_low()?;
    }
    Ok(coils)
}

fn create_mqtt_client(
    network: &NetworkConfig,
) -> anyhow::Result<(EspMqttClient<'static>, EspMqttConnection)> {
    let url = format!("mqtt://{}:{}", network.mqtt_host, network.mqtt_port);

    let conf = MqttClientConfiguration {
        client_id: Some(network.client_id.as_str()),
        username: if network.mqtt_user.is_empty() {
            None
        } else {
            Some(network.mqtt_user.as_str())
        },
        password: if network.mqtt_pass.is_empty() {
            None
        } else {
            Some(network.mqtt_pass.as_str())
        },
        ..Default::default()
    };

    Ok(EspMqttClient::new(url.as_str(), &conf)?)
}

fn spawn_mqtt_receiver(
    mut conn: EspMqttConnection,
    tx: mpsc::Sender<InboundMessage>,
    connected: Arc<AtomicBool>,
    sessions: Arc<AtomicU64>,
) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("mqtt-rx".into())
        .stack_size(8 * 1024)
        .spawn(move || loop {
            match conn.next() {
                Ok(event) => match event.payload() {
                    EventPayload::Connected(_) => {
                        info!("mqtt connected");
                        sessions.fetch_add(1, Ordering::Relaxed);
                        connected.store(true, Ordering::Relaxed);
                    }
                    EventPayload::Disconnected => {
                        warn!("mqtt disconnected");
                        connected.store(false, Ordering::Relaxed);
                    }
                    EventPayload::Received {
                        topic: Some(topic),
                        data,
                        details,
                        ..
                    } => {
                        // Commands are tiny; fragmented payloads are never valid.
                        if !matches!(details, Details::Complete) {
                            continue;
                        }
                        if data.len() > MAX_COMMAND_PAYLOAD_BYTES {
                            warn!(
                                "dropping oversized MQTT payload on topic {} ({} bytes)",
                                topic,
                                data.len()
                            );
                            continue;
                        }
                        if tx.send(InboundMessage::new(topic, data)).is_err() {
                            break;
                        }
                    }
                    _ => {}
                },
                Err(err) => {
                    connected.store(false, Ordering::Relaxed);
                    warn!("mqtt receive loop error: {err:?}");
                    thread::sleep(Duration::from_secs(2));
                }
            }
        })
        .context("failed to spawn mqtt receiver thread")?;
    Ok(())
}

fn create_portal_http_server(
    nvs_store: NvsStore,
    captive: bool,
) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 10 * 1024,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;

    let portal_paths: &[&str] = if captive {
        &[
            "/",
            "/generate_204",
            "/gen_204",
            "/hotspot-detect.html",
            "/connecttest.txt",
            "/ncsi.txt",
            "/fwlink",
        ]
    } else {
        &["/"]
    };

    for path in portal_paths {
        server.fn_handler::<anyhow::Error, _>(path, Method::Get, move |req| {
            req.into_response(200, Some("OK"), &[("Content-Type", "text/html; charset=utf-8")])?
                .write_all(PORTAL_HTML.as_bytes())?;
            Ok(())
        })?;
    }

    {
        let nvs_store = nvs_store.clone();
        server.fn_handler("/api/network", Method::Get, move |req| {
            let runtime = nvs_store.load_runtime_config().unwrap_or_default();
            let payload = build_network_config_view(&runtime);
            write_json(req, &payload)
        })?;
    }

    {
        let nvs_store = nvs_store.clone();
        server.fn_handler::<anyhow::Error, _>("/api/network", Method::Put, move |mut req| {
            let body = read_request_body(&mut req)?;
            let update: NetworkConfigUpdate =
                serde_json::from_slice(&body).context("invalid network payload")?;

            if let Err(message) = validate_network_update(&update) {
                return write_error(req, 400, message);
            }

            let runtime = apply_network_update(&nvs_store, update)?;
            write_json(req, &build_network_config_view(&runtime))
        })?;
    }

    server.fn_handler("/api/restart", Method::Post, move |req| {
        thread::Builder::new()
            .name("restart-request".into())
            .spawn(|| {
                thread::sleep(Duration::from_millis(500));
                unsafe { esp_idf_svc::sys::esp_restart() };
            })
            .context("failed to spawn restart thread")?;

        let payload = serde_json::json!({ "restarting": true });
        write_json(req, &payload)
    })?;

    Ok(server)
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
    let payload = serde_json::json!({ "error": message });
    let body = serde_json::to_vec(&payload)?;
    req.into_response(
        status_code,
        None,
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn ensure_wifi_defaults(runtime: &mut RuntimeConfig) {
    if runtime.network.wifi_ssid.is_empty() {
        runtime.network.wifi_ssid = option_env!("WIFI_SSID").unwrap_or("CHANGE_ME").to_string();
    }

    if runtime.network.wifi_pass.is_empty() {
        runtime.network.wifi_pass = option_env!("WIFI_PASS").unwrap_or_default().to_string();
    }

    if runtime.network.mqtt_host.is_empty() {
        runtime.network.mqtt_host = option_env!("MQTT_HOST").unwrap_or_default().to_string();
    }
}

fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    network: &NetworkConfig,
) -> anyhow::Result<WifiStartup> {
    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

    let ssid = network.wifi_ssid.trim();
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
        ssid: ssid.try_into().map_err(|_| anyhow!("wifi ssid too long"))?,
        password: network
            .wifi_pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{}`", ssid);

    let mut last_err = None;
    for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
        info!("wifi connect attempt {attempt}/{WIFI_CONNECT_ATTEMPTS}");
        match wifi.connect().and_then(|_| wifi.wait_netif_up()) {
            Ok(()) => {
                let ip = wifi.wifi().sta_netif().get_ip_info()?.ip;
                info!("wifi connected on attempt {attempt}, IP address: {ip}");
                last_err = None;
                break;
            }
            Err(err) => {
                warn!("wifi connect failed on attempt {attempt}: {err:#}");
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
        password: PROVISIONING_AP_PASSWORD
            .try_into()
            .map_err(|_| anyhow!("provisioning AP password too long"))?,
        auth_method: AuthMethod::WPAWPA2Personal,
        channel: 1,
        ..Default::default()
    }))?;
    wifi.start()?;
    wifi.wait_netif_up()?;
    info!(
        "provisioning AP started on `{}` (password: `{}`)",
        PROVISIONING_AP_SSID, PROVISIONING_AP_PASSWORD
    );
    Ok(())
}

fn validate_network_update(update: &NetworkConfigUpdate) -> Result<(), &'static str> {
    if update.wifi_ssid.trim().is_empty() {
        return Err("wifiSsid cannot be empty");
    }
    if update.mqtt_host.trim().is_empty() {
        return Err("mqttHost cannot be empty");
    }
    if update.mqtt_port == 0 {
        return Err("mqttPort must be between 1 and 65535");
    }
    if let Some(owner) = update.owner.as_deref() {
        if TopicScheme::new(owner, update.room.clone()).validate().is_err() {
            return Err("owner and room must be non-empty and contain no '/', '+' or '#'");
        }
    }
    Ok(())
}

fn apply_network_update(
    nvs_store: &NvsStore,
    update: NetworkConfigUpdate,
) -> anyhow::Result<RuntimeConfig> {
    let mut runtime = nvs_store.load_runtime_config().unwrap_or_default();

    runtime.network.wifi_ssid = update.wifi_ssid.trim().to_string();
    if let Some(pass) = update.wifi_pass {
        runtime.network.wifi_pass = pass;
    }
    runtime.network.mqtt_host = update.mqtt_host.trim().to_string();
    runtime.network.mqtt_port = update.mqtt_port;
    runtime.network.mqtt_user = update.mqtt_user;
    if let Some(pass) = update.mqtt_pass {
        runtime.network.mqtt_pass = pass;
    }
    if let Some(owner) = update.owner {
        runtime.topics = TopicScheme::new(owner, update.room);
    }

    nvs_store.save_runtime_config(&runtime)?;
    Ok(runtime)
}

fn build_network_config_view(runtime: &RuntimeConfig) -> NetworkConfigView {
    let network = &runtime.network;
    NetworkConfigView {
        wifi_ssid: network.wifi_ssid.clone(),
        wifi_pass_set: !network.wifi_pass.is_empty(),
        mqtt_host: network.mqtt_host.clone(),
        mqtt_port: network.mqtt_port,
        mqtt_user: network.mqtt_user.clone(),
        mqtt_pass_set: !network.mqtt_pass.is_empty(),
        owner: runtime.topics.owner.clone(),
        room: runtime.topics.room.clone(),
    }
}

impl NvsStore {
    fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let _guard = self.lock.lock().map_err(|_| anyhow!("nvs lock poisoned"))?;
        let nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; 2048];

        match nvs.get_str(NVS_RUNTIME_KEY, &mut buffer)? {
            Some(value) => Ok(serde_json::from_str::<RuntimeConfig>(value)?),
            None => Ok(RuntimeConfig::default()),
        }
    }

    fn save_runtime_config(&self, runtime: &RuntimeConfig) -> anyhow::Result<()> {
        let _guard = self.lock.lock().map_err(|_| anyhow!("nvs lock poisoned"))?;
        let mut nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let payload = serde_json::to_string(runtime)?;
        nvs.set_str(NVS_RUNTIME_KEY, &payload)?;
        Ok(())
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
    if rc == esp_idf_svc::sys::ESP_OK {
        info!("wifi power save disabled");
    } else {
        warn!("failed to disable wifi power save: esp_err_t={rc}");
    }
}

fn is_wifi_station_connected() -> bool {
    let mut ap_info = esp_idf_svc::sys::wifi_ap_record_t::default();
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_sta_get_ap_info(&mut ap_info) };
    rc == esp_idf_svc::sys::ESP_OK
}

fn maintain_wifi_health(wifi_disconnected_since: &mut Option<Instant>) {
    if is_wifi_station_connected() {
        *wifi_disconnected_since = None;
        return;
    }

    match wifi_disconnected_since {
        Some(disconnected_since)
            if disconnected_since.elapsed().as_millis() as u64 >= WIFI_RESTART_GRACE_MS =>
        {
            warn!(
                "wifi disconnected for {}s; restarting device for recovery",
                WIFI_RESTART_GRACE_MS / 1000
            );
            thread::sleep(Duration::from_millis(100));
            unsafe { esp_idf_svc::sys::esp_restart() };
        }
        Some(_) => {}
        None => *wifi_disconnected_since = Some(Instant::now()),
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
