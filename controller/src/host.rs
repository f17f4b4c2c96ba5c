use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use serde::{Deserialize, Serialize};
use tokio::{net::TcpListener, sync::Mutex};
use tracing::{info, warn};

use monitor_common::{
    automation::DEFAULT_THRESHOLD_LUX, Channel, CommandSource, Dashboard, LightAutomation,
    MotorCommand, TopicScheme, Topics,
};

const CONTROLLER_CLIENT_ID: &str = "room-monitor-controller";
const MAX_MQTT_PAYLOAD_BYTES: usize = 512;

#[derive(Clone)]
struct AppState {
    dashboard: Arc<Mutex<Dashboard>>,
    automation: Arc<Mutex<LightAutomation>>,
    topics: Arc<Topics>,
    mqtt: AsyncClient,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Deserialize)]
struct CommandRequest {
    command: String,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    topics: Topics,
    #[serde(rename = "thresholdLux")]
    threshold_lux: f32,
    #[serde(flatten)]
    dashboard: Dashboard,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut scheme = TopicScheme::default();
    if let Ok(owner) = std::env::var("MONITOR_OWNER") {
        scheme.owner = owner;
    }
    if let Ok(room) = std::env::var("MONITOR_ROOM") {
        scheme.room = Some(room);
    }
    scheme.sanitize();
    scheme.validate().context("invalid topic scheme")?;
    let topics = scheme.resolve();

    let threshold_lux = std::env::var("LIGHT_THRESHOLD_LUX")
        .ok()
        .and_then(|value| value.parse::<f32>().ok())
        .unwrap_or(DEFAULT_THRESHOLD_LUX);
    let automation = LightAutomation::new(threshold_lux);
    info!(
        "light automation: `down` at or below {} lx",
        automation.threshold_lux
    );

    let mqtt_host = std::env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let mqtt_port = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(1883);

    let mut mqtt_options = MqttOptions::new(CONTROLLER_CLIENT_ID, mqtt_host, mqtt_port);
    mqtt_options.set_keep_alive(Duration::from_secs(15));
    let mqtt_user = std::env::var("MQTT_USER").unwrap_or_default();
    let mqtt_pass = std::env::var("MQTT_PASS").unwrap_or_default();
    if !mqtt_user.is_empty() {
        mqtt_options.set_credentials(mqtt_user, mqtt_pass);
    }

    let (mqtt, eventloop) = AsyncClient::new(mqtt_options, 64);

    let app_state = AppState {
        dashboard: Arc::new(Mutex::new(Dashboard::default())),
        automation: Arc::new(Mutex::new(automation)),
        topics: Arc::new(topics),
        mqtt,
    };

    info!("commands go to `{}`", app_state.topics.control);

    spawn_mqtt_loop(app_state.clone(), eventloop);

    let app = Router::new()
        .route("/api/status", get(handle_get_status))
        .route("/api/command", post(handle_post_command))
        .with_state(app_state);

    let port = std::env::var("CONTROLLER_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind controller server at {addr}"))?;

    info!("controller listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

// Sessions are clean, so every ConnAck needs a fresh subscription.
fn subscribe_topics(mqtt: &AsyncClient, topics: &Topics) {
    for topic in topics.telemetry() {
        match mqtt.try_subscribe(topic, QoS::AtMostOnce) {
            Ok(()) => info!("subscribed to {topic}"),
            Err(err) => warn!("failed to subscribe to {topic}: {err}"),
        }
    }
}

fn spawn_mqtt_loop(app_state: AppState, mut eventloop: rumqttc::EventLoop) {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    if let Err(err) =
                        handle_mqtt_message(&app_state, message.topic, message.payload.to_vec())
                            .await
                    {
                        warn!("mqtt message handling error: {err:#}");
                    }
                }
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt connected");
                    subscribe_topics(&app_state.mqtt, &app_state.topics);
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("mqtt poll error: {err}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });
}

async fn handle_mqtt_message(
    app_state: &AppState,
    topic: String,
    payload: Vec<u8>,
) -> anyhow::Result<()> {
    if payload.len() > MAX_MQTT_PAYLOAD_BYTES {
        warn!(
            "dropping oversized MQTT payload on topic {} ({} bytes)",
            topic,
            payload.len()
        );
        return Ok(());
    }

    let message = String::from_utf8(payload).context("non utf8 mqtt payload")?;
    let Some(channel) = app_state.topics.channel_of(&topic) else {
        return Ok(());
    };

    info!("[{}] {} {}", channel.as_str(), message, channel.unit());

    let recorded = {
        let mut dashboard = app_state.dashboard.lock().await;
        dashboard.record_payload(channel, &message, Utc::now())
    };

    if channel != Channel::Lux {
        return Ok(());
    }

    if recorded.is_none() {
        warn!("ignoring unparseable lux payload `{message}`");
        return Ok(());
    }

    let Some(command) = app_state.automation.lock().await.on_lux_payload(&message) else {
        return Ok(());
    };

    let sent = send_command(app_state, command, CommandSource::Automation).await;
    if sent.is_err() {
        app_state.automation.lock().await.forget_decision();
    }
    sent
}

async fn send_command(
    app_state: &AppState,
    command: MotorCommand,
    source: CommandSource,
) -> anyhow::Result<()> {
    app_state
        .mqtt
        .publish(
            app_state.topics.control.as_str(),
            QoS::AtMostOnce,
            false,
            command.as_str().as_bytes().to_vec(),
        )
        .await
        .with_context(|| format!("failed to publish `{}`", command.as_str()))?;

    info!("sent `{}` to {}", command.as_str(), app_state.topics.control);
    app_state
        .dashboard
        .lock()
        .await
        .record_command(command, source, Utc::now());
    Ok(())
}

async fn handle_get_status(State(state): State<AppState>) -> impl IntoResponse {
    let dashboard = state.dashboard.lock().await.clone();
    Json(StatusResponse {
        topics: Topics::clone(&state.topics),
        threshold_lux: state.automation.lock().await.threshold_lux,
        dashboard,
    })
}

async fn handle_post_command(
    State(state): State<AppState>,
    request: Result<Json<CommandRequest>, JsonRejection>,
) -> impl IntoResponse {
    let Ok(Json(request)) = request else {
        return error_response(StatusCode::BAD_REQUEST, "expected {\"command\": \"up\"|\"down\"}");
    };
    let Some(command) = MotorCommand::parse(request.command.trim()) else {
        return error_response(StatusCode::BAD_REQUEST, "command must be `up` or `down`");
    };

    if let Err(err) = send_command(&state, command, CommandSource::Manual).await {
        warn!("manual command failed: {err:#}");
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "Failed to publish command");
    }

    handle_get_status(State(state)).await.into_response()
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
