//! QuidPro Simulator - One-command scripted exchange run
//!
//! Wires the full negotiation stack against in-memory collaborators and
//! replays two conversations per client: one counterparty that completes
//! an exchange and one that never supplies a target. Useful for eyeballing
//! the ledger and the live-mode switch without any platform credentials.
//!
//! # Quick Start
//!
//! ```bash
//! # Simulated mode (default): nothing leaves the process
//! quidpro-simulator
//!
//! # Exercise the live path against the in-memory transport
//! quidpro-simulator --live
//!
//! # Dump the full ledger as JSON lines
//! quidpro-simulator --dump
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use quidpro_coordinator::{
    CoordinatorConfig, InboundMessage, ManagerConfig, MultiClientCoordinator, NegotiationManager,
    NullAlerts, RecordingDispatcher, ScriptedTransport,
};
use quidpro_ledger::{ActivityLedger, InMemoryLedger};
use quidpro_types::{ActionKind, ClientProfile, CounterpartyId, MediaRef};
use quidpro_verify::{report, FixedVerifier};

/// QuidPro Simulator - scripted engagement-exchange runs
#[derive(Parser, Debug)]
#[command(
    name = "quidpro-simulator",
    about = "Replay scripted exchange conversations through the QuidPro stack",
    version
)]
struct Args {
    /// Number of client accounts to run
    #[arg(long, default_value = "2", env = "QUIDPRO_CLIENTS")]
    clients: usize,

    /// Run the live path (transport sends and reward dispatch) instead of
    /// recording simulated actions
    #[arg(long, env = "QUIDPRO_LIVE")]
    live: bool,

    /// Print every ledger entry as a JSON line at the end
    #[arg(long)]
    dump: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let transport = Arc::new(ScriptedTransport::new());
    let dispatcher = Arc::new(RecordingDispatcher::new());
    let ledger = Arc::new(InMemoryLedger::default());
    let verifier = Arc::new(FixedVerifier::new(report(
        [(ActionKind::Like, 0.96), (ActionKind::Subscribe, 0.91)],
        true,
    )));

    let mut profiles = Vec::new();
    let mut completing = Vec::new();
    let mut stalling = Vec::new();

    for index in 0..args.clients {
        let profile = ClientProfile::new(
            format!("quid_{index:02}"),
            Utc::now() - chrono::Duration::days(90),
        );

        // counterparty one: full exchange with a verifiable proof
        let eager = CounterpartyId::new();
        let media = MediaRef::new(format!("proof-{index}"));
        transport
            .load_media(media.clone(), format!("screenshot-{index}").into_bytes())
            .await;
        transport
            .script(
                &profile.id,
                vec![
                    InboundMessage::text(
                        profile.id.clone(),
                        eager.clone(),
                        "like4like and sub4sub?",
                    ),
                    InboundMessage::text(
                        profile.id.clone(),
                        eager.clone(),
                        format!("here: https://videos.example/v/{index}"),
                    ),
                    InboundMessage::image(profile.id.clone(), eager.clone(), media),
                ],
            )
            .await;
        completing.push(eager);

        // counterparty two: all talk, no target
        let vague = CounterpartyId::new();
        transport
            .script(
                &profile.id,
                vec![
                    InboundMessage::text(profile.id.clone(), vague.clone(), "trade likes?"),
                    InboundMessage::text(profile.id.clone(), vague.clone(), "one sec"),
                    InboundMessage::text(profile.id.clone(), vague.clone(), "almost"),
                    InboundMessage::text(profile.id.clone(), vague.clone(), "ok ok"),
                ],
            )
            .await;
        stalling.push(vague);

        profiles.push(profile);
    }

    let manager = Arc::new(NegotiationManager::new(
        transport.clone(),
        verifier,
        dispatcher.clone(),
        Arc::new(NullAlerts),
        ledger.clone(),
        ManagerConfig {
            live: args.live,
            ..ManagerConfig::default()
        },
    ));

    let coordinator = MultiClientCoordinator::new(
        manager.clone(),
        transport.clone(),
        profiles,
        CoordinatorConfig::default(),
    );

    tracing::info!(clients = args.clients, live = args.live, "starting simulation");
    coordinator.connect_all().await;

    wait_for_terminal(&manager, &completing, &stalling).await;
    coordinator.shutdown().await;

    for counterparty in &completing {
        if let Some(request) = manager.request_snapshot(counterparty).await {
            tracing::info!(
                counterparty = %counterparty,
                stage = ?request.stage,
                reward_sent = request.reward_sent,
                "exchange finished"
            );
        }
    }
    for counterparty in &stalling {
        if let Some(request) = manager.request_snapshot(counterparty).await {
            tracing::info!(
                counterparty = %counterparty,
                stage = ?request.stage,
                attempts = request.attempt_count,
                "exchange finished"
            );
        }
    }

    let entries = ledger.export().await;
    tracing::info!(
        entries = entries.len(),
        chain_ok = ledger.verify_chain().await,
        sent_messages = transport.sent().await.len(),
        reward_calls = dispatcher.calls().await.len(),
        "simulation done"
    );

    if args.dump {
        for entry in entries {
            println!("{}", serde_json::to_string(&entry)?);
        }
    }

    Ok(())
}

/// Poll until every scripted conversation reaches a terminal stage (or a
/// generous deadline passes).
async fn wait_for_terminal(
    manager: &Arc<NegotiationManager>,
    completing: &[CounterpartyId],
    stalling: &[CounterpartyId],
) {
    for _ in 0..200 {
        let mut done = true;
        for counterparty in completing.iter().chain(stalling) {
            match manager.request_snapshot(counterparty).await {
                Some(request) if request.stage.is_terminal() => {}
                _ => {
                    done = false;
                    break;
                }
            }
        }
        if done {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    tracing::warn!("deadline reached before every exchange settled");
}
