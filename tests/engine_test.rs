//! End-to-end interpreter tests: full conversations through the engine with
//! scripted collaborators.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use convoflow::catalog::NodeCatalog;
use convoflow::collaborator::{DayAvailability, TimeSlot};
use convoflow::config::EngineOptions;
use convoflow::engine::{FlowEngine, InboundMessage, PassReport};
use convoflow::events::DomainEvent;
use convoflow::graph::{
    AiResponseConfig, ButtonsConfig, CheckAvailabilityConfig, CompiledFlow, FlowGraph,
    MessageConfig, NodeKind,
};
use convoflow::msglog::{Direction, InMemoryMessageLog};
use convoflow::node::Button;
use convoflow::session::{
    ChannelType, ConversationSession, InMemorySessionStore, SessionStatus, SessionStore,
};
use convoflow::testutil::TestWorld;
use convoflow::vars::VariableStore;
use serde_json::json;

const USER: &str = "+5215512345678";

struct Harness {
    engine: FlowEngine,
    world: TestWorld,
    sessions: Arc<InMemorySessionStore>,
    msglog: Arc<InMemoryMessageLog>,
}

impl Harness {
    fn new(graph: FlowGraph) -> Self {
        Self::with_options(graph, EngineOptions::default())
    }

    fn with_options(graph: FlowGraph, options: EngineOptions) -> Self {
        let world = TestWorld::new();
        let registry = Arc::new(convoflow::graph::FlowRegistry::new());
        registry.activate(CompiledFlow::compile(graph).expect("compile"));

        let sessions = InMemorySessionStore::new(Duration::from_secs(600));
        let msglog = Arc::new(InMemoryMessageLog::new());
        let vars = Arc::new(VariableStore::new(
            world.constants.clone(),
            Duration::from_secs(60),
        ));
        let catalog = Arc::new(NodeCatalog::builtin(&world.collaborators(), &options));

        let engine = FlowEngine::new(
            registry,
            sessions.clone(),
            catalog,
            world.gateway.clone(),
            vars,
            msglog.clone(),
            world.events.clone(),
            options,
        );
        Self {
            engine,
            world,
            sessions,
            msglog,
        }
    }

    async fn send(&self, text: &str) -> PassReport {
        self.engine
            .handle_inbound(InboundMessage {
                tenant_id: "t1".into(),
                channel_type: ChannelType::WhatsApp,
                user_channel_id: USER.into(),
                text: text.into(),
            })
            .await
            .expect("handle_inbound")
    }

    async fn session(&self, report: &PassReport) -> ConversationSession {
        self.sessions
            .get(&report.session_id)
            .await
            .expect("session persisted")
    }
}

fn message(text: &str) -> NodeKind {
    NodeKind::Message(MessageConfig {
        text: text.into(),
        wait_for_response: false,
        capture_as: None,
        delay_ms: None,
    })
}

fn ask_message(text: &str, capture_as: &str) -> NodeKind {
    NodeKind::Message(MessageConfig {
        text: text.into(),
        wait_for_response: true,
        capture_as: Some(capture_as.into()),
        delay_ms: None,
    })
}

/// Scenario A graph: greeting, yes/no buttons, one terminal per answer.
fn yes_no_graph() -> FlowGraph {
    FlowGraph::new("f1", "t1", 1)
        .add_node("start", message("¡Hola! Bienvenido a {{clinic_name}}"))
        .add_node(
            "ask",
            NodeKind::Buttons(ButtonsConfig {
                text: "¿Quieres agendar una cita?".into(),
                buttons: vec![Button::new("Sí", "yes"), Button::new("No", "no")],
                capture_as: Some("wants_appointment".into()),
            }),
        )
        .add_node("end_yes", message("¡Perfecto, te esperamos!"))
        .add_node("end_no", message("Está bien, ¡hasta pronto!"))
        .add_edge("start", None, "ask")
        .add_edge("ask", Some("yes"), "end_yes")
        .add_edge("ask", Some("no"), "end_no")
        .with_start("start")
}

#[tokio::test]
async fn scenario_a_greeting_buttons_and_completion() {
    let h = Harness::new(yes_no_graph());
    let mut events = h.world.events.subscribe();

    // Inbound "hola": greeting + question in one outbound, paused at `ask`.
    let first = h.send("hola").await;
    assert_eq!(first.status, SessionStatus::Active);
    let delivered = first.delivered.clone().expect("outbound sent");
    assert_eq!(
        delivered.text,
        "¡Hola! Bienvenido a {{clinic_name}}\n\n¿Quieres agendar una cita?"
    );
    assert_eq!(delivered.buttons.len(), 2);

    let session = h.session(&first).await;
    assert!(session.awaiting_input);
    assert_eq!(session.current_node_id, "ask");
    assert_eq!(session.visited_nodes, vec!["start", "ask"]);

    // Inbound "Sí": completes at end_yes with its configured text.
    let second = h.send("Sí").await;
    assert_eq!(second.status, SessionStatus::Completed);
    assert_eq!(second.session_id, first.session_id);
    assert_eq!(
        second.delivered.as_ref().unwrap().text,
        "¡Perfecto, te esperamos!"
    );

    let session = h.session(&second).await;
    assert_eq!(session.variables.get("wants_appointment"), Some(&json!("yes")));
    assert_eq!(session.current_node_id, "end_yes");

    let event = events.recv().await.unwrap();
    assert!(matches!(event, DomainEvent::SessionCompleted { .. }));
}

#[tokio::test]
async fn constants_are_substituted_into_messages() {
    let h = Harness::new(yes_no_graph());
    h.world.constants.set("t1", "clinic_name", "Salud Total");

    let report = h.send("hola").await;
    assert!(
        report
            .delivered
            .unwrap()
            .text
            .starts_with("¡Hola! Bienvenido a Salud Total")
    );
}

#[tokio::test]
async fn scenario_b_closed_date_reports_the_checked_date() {
    let graph = FlowGraph::new("f2", "t1", 1)
        .add_node("ask_date", ask_message("¿Qué día te gustaría venir?", "appointment_date"))
        .add_node(
            "check",
            NodeKind::CheckAvailability(CheckAvailabilityConfig {
                date: "{{appointment_date}}".into(),
                appointment_type_id: None,
                location_id: None,
                agent_id: None,
                available_message: None,
                unavailable_message: None,
            }),
        )
        .add_node("slots", message("Elige un horario: {{slots}}"))
        .add_node("sorry", message("¿Probamos con otra fecha?"))
        .add_edge("ask_date", None, "check")
        .add_edge("check", Some("available"), "slots")
        .add_edge("check", Some("unavailable"), "sorry")
        .with_start("ask_date");
    let h = Harness::new(graph);
    h.world.scheduling.set_day(
        "2026-08-16",
        DayAvailability {
            available_slots: vec![],
            business_hours: None,
            is_closed: true,
        },
    );

    h.send("hola").await;
    let report = h.send("2026-08-16").await;

    let text = report.delivered.unwrap().text;
    assert!(text.contains("2026-08-16"), "unavailable message must contain the literal date: {text}");
    assert!(text.contains("¿Probamos con otra fecha?"));
    assert_eq!(report.status, SessionStatus::Completed);
}

#[tokio::test]
async fn available_date_feeds_slots_into_the_next_message() {
    let graph = FlowGraph::new("f2", "t1", 1)
        .add_node("ask_date", ask_message("¿Qué día?", "appointment_date"))
        .add_node(
            "check",
            NodeKind::CheckAvailability(CheckAvailabilityConfig {
                date: "{{appointment_date}}".into(),
                appointment_type_id: None,
                location_id: None,
                agent_id: None,
                available_message: Some("El {{date}} tenemos: {{slots}}".into()),
                unavailable_message: None,
            }),
        )
        .add_edge("ask_date", None, "check")
        .with_start("ask_date");
    let h = Harness::new(graph);
    h.world.scheduling.set_day(
        "2026-08-17",
        DayAvailability {
            available_slots: vec![TimeSlot::new("09:00", "09:30"), TimeSlot::new("16:00", "16:30")],
            business_hours: None,
            is_closed: false,
        },
    );

    h.send("hola").await;
    let report = h.send("2026-08-17").await;
    assert_eq!(
        report.delivered.unwrap().text,
        "El 2026-08-17 tenemos: 09:00, 16:00"
    );
}

#[tokio::test]
async fn scenario_c_at_most_three_buttons_reach_the_user() {
    let graph = FlowGraph::new("f3", "t1", 1)
        .add_node(
            "ask",
            NodeKind::Buttons(ButtonsConfig {
                text: "Elige".into(),
                buttons: vec![
                    Button::new("Uno", "1"),
                    Button::new("Dos", "2"),
                    Button::new("Tres", "3"),
                    Button::new("Cuatro", "4"),
                ],
                capture_as: None,
            }),
        )
        .with_start("ask");
    let h = Harness::new(graph);

    let report = h.send("hola").await;
    let delivered = report.delivered.unwrap();
    assert_eq!(delivered.buttons.len(), 3);
    assert!(delivered.buttons.iter().all(|b| b.value != "4"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scenario_d_rapid_messages_are_processed_in_arrival_order() {
    let graph = FlowGraph::new("f4", "t1", 1)
        .add_node("q1", ask_message("¿Primera?", "first"))
        .add_node(
            "q2",
            NodeKind::Message(MessageConfig {
                text: "¿Segunda?".into(),
                wait_for_response: true,
                capture_as: Some("second".into()),
                // keeps the first pass in flight while the second arrives
                delay_ms: Some(40),
            }),
        )
        .add_node("done", message("Gracias"))
        .add_edge("q1", None, "q2")
        .add_edge("q2", None, "done")
        .with_start("q1");
    let h = Arc::new(Harness::new(graph));

    let report = h.send("hola").await; // paused at q1
    assert_eq!(h.session(&report).await.current_node_id, "q1");

    let h1 = h.clone();
    let a = tokio::spawn(async move { h1.send("one").await });
    tokio::time::sleep(Duration::from_millis(10)).await;
    let h2 = h.clone();
    let b = tokio::spawn(async move { h2.send("two").await });

    let first = a.await.unwrap();
    let second = b.await.unwrap();

    assert_eq!(first.session_id, second.session_id);
    assert_eq!(second.status, SessionStatus::Completed);

    let session = h.session(&second).await;
    assert_eq!(session.variables.get("first"), Some(&json!("one")));
    assert_eq!(session.variables.get("second"), Some(&json!("two")));
    assert_eq!(session.current_node_id, "done");
}

#[tokio::test]
async fn unrecognized_reply_reprompts_then_errors_after_the_cap() {
    let graph = FlowGraph::new("f5", "t1", 1)
        .add_node(
            "ask",
            NodeKind::Buttons(ButtonsConfig {
                text: "¿Sí o no?".into(),
                buttons: vec![Button::new("Sí", "yes"), Button::new("No", "no")],
                capture_as: None,
            }),
        )
        .add_node("end", message("ok"))
        .add_edge("ask", Some("yes"), "end")
        .with_start("ask");
    let mut options = EngineOptions::default();
    options.max_input_retries = 2;
    let h = Harness::with_options(graph, options.clone());
    let mut events = h.world.events.subscribe();

    h.send("hola").await;

    // two tolerated retries, each re-prompting with the invalid-input nudge
    for _ in 0..2 {
        let retry = h.send("quizás").await;
        assert_eq!(retry.status, SessionStatus::Active);
        let text = retry.delivered.unwrap().text;
        assert!(text.starts_with(&options.invalid_input_message));
        assert!(text.contains("¿Sí o no?"));
    }

    // third strike: session errors but the user still hears back
    let last = h.send("quizás").await;
    assert_eq!(last.status, SessionStatus::Error);
    assert_eq!(last.delivered.unwrap().text, options.fallback_message);
    assert!(matches!(
        events.recv().await.unwrap(),
        DomainEvent::SessionFailed { .. }
    ));
}

#[tokio::test]
async fn cycle_guard_trips_the_iteration_cap() {
    let graph = FlowGraph::new("f6", "t1", 1)
        .add_node("a", message("ping"))
        .add_node("b", message("pong"))
        .add_edge("a", None, "b")
        .add_edge("b", None, "a")
        .with_start("a");
    let mut options = EngineOptions::default();
    options.max_hops = 10;
    let h = Harness::with_options(graph, options.clone());

    let report = h.send("hola").await;
    assert_eq!(report.status, SessionStatus::Error);
    assert_eq!(report.hops, 11);
    assert!(
        report
            .delivered
            .as_ref()
            .unwrap()
            .text
            .ends_with(&options.fallback_message)
    );

    let session = h.session(&report).await;
    assert_eq!(session.visited_nodes.len(), 10);
}

#[tokio::test]
async fn errored_sessions_keep_answering_with_the_fallback() {
    let graph = FlowGraph::new("f6", "t1", 1)
        .add_node("a", message("ping"))
        .add_edge("a", None, "a")
        .with_start("a");
    let h = Harness::new(graph);

    let broken = h.send("hola").await;
    assert_eq!(broken.status, SessionStatus::Error);

    let again = h.send("¿sigues ahí?").await;
    assert_eq!(again.session_id, broken.session_id);
    assert_eq!(again.status, SessionStatus::Error);
    assert_eq!(again.hops, 0);
    assert_eq!(
        again.delivered.unwrap().text,
        EngineOptions::default().fallback_message
    );
}

#[tokio::test]
async fn completed_sessions_restart_fresh_on_the_next_message() {
    let h = Harness::new(yes_no_graph());

    h.send("hola").await;
    let done = h.send("No").await;
    assert_eq!(done.status, SessionStatus::Completed);

    let fresh = h.send("hola otra vez").await;
    assert_ne!(fresh.session_id, done.session_id);
    assert_eq!(fresh.status, SessionStatus::Active);
    let session = h.session(&fresh).await;
    assert_eq!(session.current_node_id, "ask");
    assert!(session.variables.is_empty());
}

#[tokio::test]
async fn ai_reply_is_delivered_and_metered_once() {
    let graph = FlowGraph::new("f7", "t1", 1)
        .add_node(
            "ai",
            NodeKind::AiResponse(AiResponseConfig {
                prompt: "User said: {{question}}".into(),
                system_prompt: None,
                model: None,
                temperature: None,
                max_tokens: None,
                fallback_message: None,
                quota_message: None,
                capture_as: None,
            }),
        )
        .with_start("ai");
    let h = Harness::new(graph);

    let report = h.send("¿a qué hora abren?").await;
    assert_eq!(
        report.delivered.unwrap().text,
        "Our opening hours are 9 to 5."
    );
    assert_eq!(h.world.meter.used("t1"), 42);
    assert_eq!(h.world.agent.calls(), 1);
}

#[tokio::test]
async fn gateway_outage_is_swallowed_but_state_still_advances() {
    let h = Harness::new(yes_no_graph());
    h.world.gateway.go_down();

    let report = h.send("hola").await;
    assert!(report.delivered.is_none());

    // the walk still happened and was persisted
    let session = h.session(&report).await;
    assert_eq!(session.current_node_id, "ask");
    assert!(session.awaiting_input);

    // once the gateway is back the conversation picks up where it paused
    h.world.gateway.go_up();
    let next = h.send("No").await;
    assert_eq!(next.status, SessionStatus::Completed);
    assert_eq!(next.delivered.unwrap().text, "Está bien, ¡hasta pronto!");
}

#[tokio::test]
async fn transcript_logs_both_directions() {
    let h = Harness::new(yes_no_graph());
    let report = h.send("hola").await;

    let records = h.msglog.for_session(&report.session_id);
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].direction, Direction::Inbound);
    assert_eq!(records[0].content, "hola");
    assert_eq!(records[1].direction, Direction::Outbound);
    assert_eq!(records[1].kind, "buttons");
}

#[tokio::test]
async fn round_tripped_graph_behaves_identically() {
    let original = yes_no_graph();
    let json = serde_json::to_string(&original).unwrap();
    let reparsed: FlowGraph = serde_json::from_str(&json).unwrap();

    let mut transcripts = Vec::new();
    for graph in [original, reparsed] {
        let h = Harness::new(graph);
        let mut texts = Vec::new();
        texts.push(h.send("hola").await.delivered.unwrap().text);
        texts.push(h.send("Sí").await.delivered.unwrap().text);
        transcripts.push(texts);
    }
    assert_eq!(transcripts[0], transcripts[1]);
}

#[tokio::test]
async fn a_waiting_node_never_advances_without_new_input() {
    let h = Harness::new(yes_no_graph());

    let report = h.send("hola").await;
    let paused = h.session(&report).await;
    assert_eq!(paused.current_node_id, "ask");

    // the session only moved past `ask` on the pass that consumed "Sí"
    let report = h.send("Sí").await;
    let done = h.session(&report).await;
    let ask_visits = done.visited_nodes.iter().filter(|n| *n == "ask").count();
    assert_eq!(ask_visits, 1);
    assert_eq!(done.visited_nodes.last().unwrap(), "end_yes");
}
