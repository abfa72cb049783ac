use crate::prelude::*;

use bytes::Bytes;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, Incoming, MqttOptions, Publish, QoS,
    Transport,
};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{Instant, Interval, MissedTickBehavior};

/// Largest frame we accept from the broker.
const MAX_PACKET_SIZE: usize = 256 * 1024;

#[derive(Eq, PartialEq, Debug, Clone)]
pub enum ChannelData {
    /// One raw property message, still encrypted.
    Frame(Bytes),
    Connected,
    Disconnected,
    Shutdown,
}

/// Body of the "get all properties" request. The device answers with a
/// full status frame on the property topic.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DataRequest {
    version: &'static str,
    module_type: u32,
    operate_type: &'static str,
    params: serde_json::Value,
}

impl DataRequest {
    fn get() -> Self {
        Self {
            version: "1.0",
            module_type: 0,
            operate_type: "get",
            params: serde_json::json!({}),
        }
    }
}

fn is_shutdown(message: &std::result::Result<ChannelData, RecvError>) -> bool {
    matches!(message, Ok(ChannelData::Shutdown) | Err(RecvError::Closed))
}

/// Sleeps for `delay`. Returns true if a shutdown arrived first.
async fn shutdown_during(control: &mut broadcast::Receiver<ChannelData>, delay: Duration) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            _ = &mut sleep => return false,
            message = control.recv() => {
                if is_shutdown(&message) {
                    return true;
                }
            }
        }
    }
}

/// Repeats the data request; the first tick is one period out since a
/// request already goes out on connect.
fn request_timer(period: Duration) -> Interval {
    let mut timer = tokio::time::interval_at(Instant::now() + period, period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    timer
}

/// Cloud broker connection. Delivers property frames and lifecycle events
/// to the coordinator over `from_mqtt`; the event loop owns reconnects.
#[derive(Clone)]
pub struct Mqtt {
    config: ConfigWrapper,
    channels: Channels,
}

impl Mqtt {
    pub fn new(config: ConfigWrapper, channels: Channels) -> Self {
        Self { config, channels }
    }

    pub async fn start(&self) -> Result<()> {
        let c = self.config.mqtt();

        if !c.enabled() {
            info!("mqtt disabled, skipping");
            return Ok(());
        }

        let mut options = MqttOptions::new(c.client_id(), c.host(), c.port());
        options.set_keep_alive(c.keep_alive());
        options.set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);
        if let (Some(u), Some(p)) = (c.username(), c.password()) {
            options.set_credentials(u, p);
        }
        if c.tls() {
            options.set_transport(Transport::tls_with_default_config());
        }

        info!(
            "initializing mqtt at {}:{} for device {}",
            c.host(),
            c.port(),
            c.serial()
        );

        let (client, eventloop) = AsyncClient::new(options, 10);

        self.receiver(client, eventloop).await
    }

    pub async fn stop(&self) -> Result<()> {
        info!("Stopping MQTT client...");
        let _ = self.channels.to_mqtt.send(ChannelData::Shutdown);
        Ok(())
    }

    // mqtt -> coordinator
    async fn receiver(&self, client: AsyncClient, mut eventloop: EventLoop) -> Result<()> {
        let mut control = self.channels.to_mqtt.subscribe();
        let mut requests = request_timer(self.config.mqtt().request_interval());
        let mut connected = false;

        loop {
            tokio::select! {
                message = control.recv() => {
                    if is_shutdown(&message) {
                        info!("MQTT receiver shutting down");
                        let _ = client.disconnect().await;
                        break;
                    }
                }
                _ = requests.tick(), if connected => {
                    // fallback for a device that has gone quiet
                    if let Err(e) = self.request_data(&client).await {
                        warn!("data request failed: {:#}", e);
                    }
                }
                event = eventloop.poll() => {
                    match event {
                        Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                            if ack.code == ConnectReturnCode::Success {
                                connected = true;
                                requests.reset();
                                if let Err(e) = self.on_connected(&client).await {
                                    warn!("post-connect setup failed: {:#}", e);
                                }
                            } else {
                                warn!("broker refused connection: {:?}", ack.code);
                            }
                        }
                        Ok(Event::Incoming(Incoming::Publish(publish))) => {
                            self.handle_message(publish);
                        }
                        Err(e) => {
                            error!("{}", e);
                            if connected {
                                connected = false;
                                self.send(ChannelData::Disconnected);
                            }
                            let delay = self.config.mqtt().reconnect_delay();
                            info!("reconnecting in {}s", delay.as_secs());
                            if shutdown_during(&mut control, delay).await {
                                info!("MQTT receiver shutting down");
                                break;
                            }
                        }
                        _ => {} // keepalives etc
                    }
                }
            }
        }

        if connected {
            self.send(ChannelData::Disconnected);
        }

        info!("MQTT receiver loop exiting");
        Ok(())
    }

    async fn on_connected(&self, client: &AsyncClient) -> Result<()> {
        let c = self.config.mqtt();

        // the session is clean, so subscribe again after every connect
        client
            .subscribe(c.property_topic(), QoS::AtLeastOnce)
            .await?;
        self.send(ChannelData::Connected);

        self.request_data(client).await
    }

    /// Asks the device for a full status frame. Needs `user_id`.
    async fn request_data(&self, client: &AsyncClient) -> Result<()> {
        let Some(topic) = self.config.mqtt().get_topic() else {
            return Ok(());
        };

        let payload = serde_json::to_vec(&DataRequest::get())?;
        debug!("requesting device data on {}", topic);
        client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await?;

        Ok(())
    }

    fn handle_message(&self, publish: Publish) {
        if publish.topic != self.config.mqtt().property_topic() {
            debug!("ignoring message on {}", publish.topic);
            return;
        }

        trace!("RX: {} bytes on {}", publish.payload.len(), publish.topic);
        self.send(ChannelData::Frame(publish.payload));
    }

    fn send(&self, data: ChannelData) {
        if self.channels.from_mqtt.send(data).is_err() {
            warn!("send(from_mqtt) failed - coordinator not listening?");
        }
    }
}
