//! Example opening an Aggregated Discovery Service stream with xds-transport.
//!
//! This example shows:
//! - How to create a [`Transport`] with the tonic factory
//! - How to open a streaming call with prost marshallers
//! - How to pull responses one at a time and ACK them
//!
//! # Configuration (environment variables)
//!
//! - `XDS_SERVER`: Target of the xDS management server (default: `localhost:18000`)
//! - `XDS_TYPE_URL`: Resource type to subscribe to (default: Listener)
//! - `XDS_RESOURCES`: Comma-separated resource names (default: wildcard)
//! - `XDS_WAIT_FOR_READY`: Set to `1` to wait for the server instead of failing fast
//!
//! # Usage
//!
//! ```sh
//! XDS_RESOURCES=my-listener cargo run -p xds-transport --example ads_stream
//!
//! XDS_SERVER=xds.example.com:18000 \
//!   XDS_TYPE_URL=type.googleapis.com/envoy.config.cluster.v3.Cluster \
//!   cargo run -p xds-transport --example ads_stream
//! ```

use std::sync::Arc;

use envoy_types::pb::envoy::config::core::v3::Node;
use envoy_types::pb::envoy::service::discovery::v3::{DiscoveryRequest, DiscoveryResponse};
use tokio::sync::mpsc;

use xds_transport::{
    EventHandler, ProstMarshaller, ServerDescriptor, Status, StreamingCall, TonicTransportFactory,
    Transport, TransportConfig, TransportFactory,
};

const ADS_METHOD: &str =
    "envoy.service.discovery.v3.AggregatedDiscoveryService/StreamAggregatedResources";
const LISTENER_TYPE_URL: &str = "type.googleapis.com/envoy.config.listener.v3.Listener";

struct Args {
    server: String,
    type_url: String,
    resources: Vec<String>,
    wait_for_ready: bool,
}

fn parse_args() -> Args {
    let server = std::env::var("XDS_SERVER").unwrap_or_else(|_| "localhost:18000".to_string());
    let type_url =
        std::env::var("XDS_TYPE_URL").unwrap_or_else(|_| LISTENER_TYPE_URL.to_string());
    let resources = std::env::var("XDS_RESOURCES")
        .unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    let wait_for_ready = std::env::var("XDS_WAIT_FOR_READY").is_ok_and(|v| v == "1");

    Args {
        server,
        type_url,
        resources,
        wait_for_ready,
    }
}

enum StreamEvent {
    Response(DiscoveryResponse),
    Ready,
    Closed(Status),
}

/// Forwards stream events to the main task.
struct ChannelHandler {
    tx: mpsc::UnboundedSender<StreamEvent>,
}

impl EventHandler<DiscoveryResponse> for ChannelHandler {
    fn on_recv_message(&self, response: DiscoveryResponse) {
        let _ = self.tx.send(StreamEvent::Response(response));
    }

    fn on_status_received(&self, status: Status) {
        let _ = self.tx.send(StreamEvent::Closed(status));
    }

    fn on_ready(&self) {
        let _ = self.tx.send(StreamEvent::Ready);
    }
}

/// Requests that could not be sent because the stream was not ready.
struct Outbox {
    call: Arc<StreamingCall<DiscoveryRequest, DiscoveryResponse>>,
    pending: Vec<DiscoveryRequest>,
}

impl Outbox {
    fn send(&mut self, request: DiscoveryRequest) -> xds_transport::Result<()> {
        self.pending.push(request);
        self.flush()
    }

    fn flush(&mut self) -> xds_transport::Result<()> {
        while !self.pending.is_empty() && self.call.is_ready() {
            let request = self.pending.remove(0);
            self.call.send_message(&request)?;
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = parse_args();

    println!("xds-transport Example\n");
    println!("Connecting to xDS server: {}", args.server);

    let config = TransportConfig::default().with_wait_for_ready(args.wait_for_ready);
    let factory = TonicTransportFactory::new(config);
    let transport: Transport = factory.create(&ServerDescriptor::insecure(&args.server))?;

    let call = Arc::new(transport.create_streaming_call(
        ADS_METHOD,
        ProstMarshaller::<DiscoveryRequest>::new(),
        ProstMarshaller::<DiscoveryResponse>::new(),
    )?);

    let (tx, mut rx) = mpsc::unbounded_channel();
    call.start(ChannelHandler { tx })?;

    let node = Node {
        id: "example-node".to_string(),
        user_agent_name: "xds-transport".to_string(),
        ..Default::default()
    };
    let mut outbox = Outbox {
        call: call.clone(),
        pending: Vec::new(),
    };
    outbox.send(DiscoveryRequest {
        node: Some(node),
        type_url: args.type_url.clone(),
        resource_names: args.resources.clone(),
        ..Default::default()
    })?;

    while let Some(event) = rx.recv().await {
        match event {
            StreamEvent::Response(response) => {
                println!("Response received:");
                println!("  version:    {}", response.version_info);
                println!("  nonce:      {}", response.nonce);
                println!("  resources:  {}", response.resources.len());
                println!();

                // ACK the response, then ask for the next one. Sending fails
                // once the server has closed the stream; pulling still drains
                // what arrived before the close.
                let ack = DiscoveryRequest {
                    version_info: response.version_info,
                    response_nonce: response.nonce,
                    type_url: response.type_url,
                    resource_names: args.resources.clone(),
                    ..Default::default()
                };
                if let Err(e) = outbox.send(ack) {
                    println!("Not acknowledged: {e}");
                }
                if let Err(e) = call.start_recv_message() {
                    println!("Stream ended: {e}");
                }
            }

            StreamEvent::Ready => outbox.flush()?,

            StreamEvent::Closed(status) => {
                println!("Stream closed: {:?} {}", status.code(), status.message());
                break;
            }
        }
    }

    transport.shutdown();
    println!("Exiting");
    Ok(())
}
