// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The TwinSync edge gateway binary: wires the MQTT facade, device sessions, ingress router, and
//! egress pump/roster publisher together from CLI-supplied connection settings.
//!
//! Per-device transport configuration has no file-backed config store in this crate
//! (`SPEC_FULL.md` §1's config-file-stores non-goal) - this binary assembles a small fixed
//! sample fleet as a worked example; a production deployment would supply its own device list
//! the same way it supplies `--certfile`.

use std::sync::Arc;

use clap::Parser;
use env_logger::Builder;
use log::LevelFilter;

use gateway_mqtt::control_packet::QoS;
use gateway_mqtt::{MqttConnectionSettingsBuilder, MqttFacade};
use twinsync_gateway::config::{GatewayIdentityBuilder, PlcConfig, RobotConfig};
use twinsync_gateway::egress::EgressPump;
use twinsync_gateway::ingress::{IngressRouter, SessionTable};
use twinsync_gateway::model::DeviceKey;
use twinsync_gateway::roster::RosterPublisher;
use twinsync_gateway::session::{ManagedSession, PlcSession, RobotSession};
use twinsync_gateway::transport::plc::SimulatedPlcTransport;
use twinsync_gateway::transport::robot::SimulatedRobotTransport;

#[derive(Parser)]
#[command(version, about = "TwinSync industrial edge gateway")]
struct Cli {
    /// MQTT broker hostname.
    #[arg(short = 'n', long, default_value = "localhost")]
    hostname: String,
    /// MQTT broker port.
    #[arg(short, long, default_value_t = 8883)]
    port: u16,
    /// Do not use TLS for the broker connection.
    #[arg(long, default_value_t = false)]
    notls: bool,
    /// Trusted certificate bundle for TLS.
    #[arg(short = 'T', long)]
    cafile: Option<String>,
    /// Client authentication certificate file.
    #[arg(short = 'C', long)]
    certfile: Option<String>,
    /// Client authentication private key file.
    #[arg(short = 'K', long)]
    keyfile: Option<String>,
    /// Tenant identifier for this gateway instance.
    #[arg(long, default_value = "demo-tenant")]
    tenant_id: String,
    /// This gateway instance's identifier.
    #[arg(long, default_value = "demo-gw")]
    gateway_id: String,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    Builder::new()
        .filter_level(LevelFilter::Info)
        .format_timestamp(None)
        .filter_module("rumqttc", LevelFilter::Warn)
        .init();

    let cli = Cli::parse();

    let identity = GatewayIdentityBuilder::default()
        .tenant_id(cli.tenant_id)
        .gateway_id(cli.gateway_id)
        .build()?;

    let client_id = format!("twinsync-gateway-{}-{}", identity.tenant_id, identity.gateway_id);
    let settings = MqttConnectionSettingsBuilder::default()
        .client_id(client_id)
        .hostname(cli.hostname)
        .tcp_port(cli.port)
        .use_tls(!cli.notls)
        .ca_file(cli.cafile)
        .cert_file(cli.certfile)
        .key_file(cli.keyfile)
        .build()?;

    let facade = MqttFacade::connect(&settings)?;
    let registry = Arc::new(SessionTable::new());
    let pump = EgressPump::new(facade.clone(), identity.tenant_id.as_str(), identity.gateway_id.as_str());
    let roster = RosterPublisher::new(facade.clone(), identity.tenant_id.as_str(), identity.gateway_id.as_str());

    // Sample fleet: a simulated robot and a simulated PLC, standing in for a real device list
    // until a native RobotTransport/PlcTransport is wired up for the deployment's hardware.
    let robot_key = DeviceKey::new(identity.tenant_id.as_str(), identity.gateway_id.as_str(), "R1", "robot-fanuc");
    let robot_config = RobotConfig::new("Line1-Robot", "127.0.0.1", 9000);
    let robot_session = RobotSession::new(robot_key, Box::new(SimulatedRobotTransport::new()), &robot_config);
    robot_session.connect().await?;
    register_session(
        &registry,
        &pump,
        &roster,
        robot_session.clone() as Arc<dyn ManagedSession>,
        "Line 1 Robot",
        "robot",
    );

    let plc_key = DeviceKey::new(identity.tenant_id.as_str(), identity.gateway_id.as_str(), "PLC1", "plc-allen-bradley");
    let plc_config = PlcConfig::new("Line1-PLC", "127.0.0.1", 44818);
    let plc_session = PlcSession::new(plc_key, Box::new(SimulatedPlcTransport::new(&plc_config)), &plc_config);
    plc_session.connect().await?;
    register_session(
        &registry,
        &pump,
        &roster,
        plc_session.clone() as Arc<dyn ManagedSession>,
        "Line 1 PLC",
        "plc",
    );

    let router = Arc::new(IngressRouter::new(
        identity.tenant_id.as_str(),
        identity.gateway_id.as_str(),
        registry,
    ));
    let filter = router.topic_filter();
    facade.add_handler(router.into_handler()).await;
    facade.subscribe(&filter, QoS::AtLeastOnce).await?;

    log::info!("gateway running, subscribed to {filter}");
    tokio::signal::ctrl_c().await?;
    log::info!("shutdown requested, disconnecting sessions");
    robot_session.disconnect().await;
    plc_session.disconnect().await;
    pump.shutdown();
    Ok(())
}

fn register_session(
    registry: &Arc<SessionTable>,
    pump: &Arc<EgressPump>,
    roster: &Arc<RosterPublisher>,
    session: Arc<dyn ManagedSession>,
    display_name: &str,
    connection_type: &str,
) {
    pump.attach_session(&session);
    roster.attach_session(&session, display_name, connection_type);
    registry.register(session);
}
