// Integration tests for the turn pipeline
//
// The pipeline is driven directly through its input channel, without a room
// or mixer, on a paused clock.

mod common;

use anyhow::Result;
use common::*;
use loqa_voice_agent::audio::AudioFrame;
use loqa_voice_agent::events::{EventSender, SessionEvent, SessionEventKind, Stage};
use loqa_voice_agent::pipeline::{OutboundSink, PipelineConfig, PipelineExit, StageProviders, TurnPipeline, TurnState};
use loqa_voice_agent::providers::Role;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(30);

struct Harness {
    input: mpsc::Sender<AudioFrame>,
    events: broadcast::Receiver<SessionEvent>,
    log: broadcast::Receiver<SessionEvent>,
    sink: Arc<SinkCounters>,
    cancel: CancellationToken,
    task: JoinHandle<(PipelineExit, Vec<(Role, String)>)>,
}

impl Harness {
    fn start(factory: &FakeProviderFactory, config: PipelineConfig) -> Self {
        let providers = StageProviders {
            recognizer: factory.recognizer.clone(),
            reasoner: factory.reasoner.clone(),
            synthesizer: factory.synthesizer.clone(),
        };
        let sink = Arc::new(SinkCounters::default());
        let events = EventSender::new(Uuid::new_v4());
        let (rx_events, log) = (events.subscribe(), events.subscribe());
        let (mut pipeline, _states) = TurnPipeline::new(
            providers,
            OutboundSink::new(Box::new(CountingSink(Arc::clone(&sink)))),
            config,
            events,
        );

        let (input, rx) = mpsc::channel(256);
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            let exit = pipeline.run(rx, token).await;
            let history = pipeline
                .history()
                .iter()
                .map(|m| (m.role, m.content.clone()))
                .collect();
            (exit, history)
        });

        Self {
            input,
            events: rx_events,
            log,
            sink,
            cancel,
            task,
        }
    }

    async fn feed(&self, frames: Vec<AudioFrame>) -> Result<()> {
        for frame in frames {
            self.input.send(frame).await?;
            tokio::time::sleep(Duration::from_millis(FRAME_MS)).await;
        }
        Ok(())
    }

    async fn until(&mut self, pred: impl FnMut(&SessionEventKind) -> bool) -> Result<SessionEventKind> {
        wait_for_event(&mut self.events, WAIT, pred)
            .await
            .map(|e| e.kind)
            .ok_or_else(|| anyhow::anyhow!("expected event did not arrive"))
    }

    async fn until_state(&mut self, state: TurnState) -> Result<()> {
        self.until(|k| matches!(k, SessionEventKind::StateChanged { to, .. } if *to == state))
            .await
            .map(|_| ())
    }

    async fn stop(self) -> Result<(PipelineExit, Vec<(Role, String)>, Vec<SessionEventKind>)> {
        let Harness {
            cancel,
            task,
            mut log,
            ..
        } = self;
        cancel.cancel();
        let (exit, history) = task.await?;
        Ok((exit, history, drain(&mut log)))
    }
}

fn quiet_config() -> PipelineConfig {
    PipelineConfig {
        greeting: None,
        ..Default::default()
    }
}

#[tokio::test(start_paused = true)]
async fn test_one_to_one_turn_sequence() -> Result<()> {
    // Setup: one participant says "hello"
    let factory = FakeProviderFactory::conversational();
    let mut harness = Harness::start(&factory, quiet_config());

    harness.feed(utterance_frames(400, 700)).await?;
    let response = harness
        .until(|k| matches!(k, SessionEventKind::Response { .. }))
        .await?;
    harness.until_state(TurnState::Listening).await?;

    let sink = Arc::clone(&harness.sink);
    let (exit, history, log) = harness.stop().await?;

    // Verify: full cycle, non-empty reply played out
    assert_eq!(
        response,
        SessionEventKind::Response {
            text: "Hi there!".to_string(),
            fallback: false
        }
    );
    assert_eq!(
        state_path(&log),
        vec![
            TurnState::Transcribing,
            TurnState::Reasoning,
            TurnState::Speaking,
            TurnState::Listening
        ]
    );
    assert!(log.contains(&SessionEventKind::Transcript {
        text: "hello".to_string()
    }));
    assert_eq!(sink.frames.load(Ordering::SeqCst), 10);
    assert_eq!(sink.clears.load(Ordering::SeqCst), 0);
    assert_eq!(exit, PipelineExit::Stopped);
    assert_eq!(
        history,
        vec![
            (Role::User, "hello".to_string()),
            (Role::Assistant, "Hi there!".to_string())
        ]
    );
    assert_eq!(factory.synthesizer.counters.completed(), 1);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_barge_in_cancels_speech() -> Result<()> {
    // Setup: a long reply so there is time to talk over it
    let factory = FakeProviderFactory::new(
        FakeRecognizer::replying("tell me a story"),
        FakeReasoner::replying("Once upon a time..."),
        FakeSynthesizer::new(200, Duration::from_millis(FRAME_MS)),
    );
    factory.recognizer.push("tell me a story");
    factory.recognizer.push("stop, actually");
    let mut harness = Harness::start(&factory, quiet_config());

    harness.feed(utterance_frames(400, 700)).await?;
    harness.until_state(TurnState::Speaking).await?;
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Participant talks over the agent
    harness.feed(utterance_frames(400, 0)).await?;
    let interrupted = harness
        .until(|k| matches!(k, SessionEventKind::Interrupted { .. }))
        .await?;

    // Verify: synthesis released, not merely silenced, at the moment of barge-in
    let SessionEventKind::Interrupted { speech_ms } = interrupted else {
        unreachable!()
    };
    assert!(speech_ms >= 300);
    assert_eq!(factory.synthesizer.counters.released(), 1);
    assert_eq!(factory.synthesizer.counters.completed(), 0);
    assert_eq!(harness.sink.clears.load(Ordering::SeqCst), 1);

    // The interrupting speech becomes the next turn
    harness.feed(utterance_frames(0, 700)).await?;
    harness
        .until(|k| matches!(k, SessionEventKind::Transcript { text } if text == "stop, actually"))
        .await?;
    harness.until_state(TurnState::Listening).await?;

    let (_, history, log) = harness.stop().await?;
    let path = state_path(&log);
    let speaking = path.iter().position(|s| *s == TurnState::Speaking).unwrap();
    assert_eq!(path[speaking + 1], TurnState::Interrupted);
    assert_eq!(path[speaking + 2], TurnState::Listening);
    assert_eq!(factory.recognizer.calls(), 2);
    // the cut-off reply is not part of the conversation
    assert_eq!(history[0], (Role::User, "tell me a story".to_string()));
    assert_eq!(history[1], (Role::User, "stop, actually".to_string()));

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_short_noise_does_not_interrupt() -> Result<()> {
    let factory = FakeProviderFactory::new(
        FakeRecognizer::replying("hello"),
        FakeReasoner::replying("Hi there!"),
        FakeSynthesizer::new(100, Duration::from_millis(FRAME_MS)),
    );
    let mut harness = Harness::start(&factory, quiet_config());

    harness.feed(utterance_frames(400, 700)).await?;
    harness.until_state(TurnState::Speaking).await?;

    // 100ms cough, under the 300ms barge-in minimum
    harness.feed(utterance_frames(100, 600)).await?;
    harness.until_state(TurnState::Listening).await?;

    let (_, _, log) = harness.stop().await?;
    assert!(!log
        .iter()
        .any(|k| matches!(k, SessionEventKind::Interrupted { .. })));
    assert_eq!(factory.synthesizer.counters.completed(), 1);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_interruptions_disabled_finishes_speaking() -> Result<()> {
    // Setup: barge-in turned off
    let factory = FakeProviderFactory::new(
        FakeRecognizer::replying("hello"),
        FakeReasoner::replying("Let me finish."),
        FakeSynthesizer::new(100, Duration::from_millis(FRAME_MS)),
    );
    let config = PipelineConfig {
        interruptions_enabled: false,
        ..quiet_config()
    };
    let mut harness = Harness::start(&factory, config);

    harness.feed(utterance_frames(400, 700)).await?;
    harness.until_state(TurnState::Speaking).await?;
    harness.feed(utterance_frames(600, 0)).await?;
    harness.until_state(TurnState::Listening).await?;

    let sink = Arc::clone(&harness.sink);
    let (_, _, log) = harness.stop().await?;

    // Verify: speech while speaking neither interrupts nor starts a turn
    assert!(!log
        .iter()
        .any(|k| matches!(k, SessionEventKind::Interrupted { .. })));
    assert_eq!(factory.synthesizer.counters.completed(), 1);
    assert_eq!(sink.frames.load(Ordering::SeqCst), 100);
    assert_eq!(sink.clears.load(Ordering::SeqCst), 0);
    assert_eq!(factory.recognizer.calls(), 1);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_reasoning_timeout_speaks_fallback() -> Result<()> {
    // Setup: reasoning takes longer than its deadline
    let factory = FakeProviderFactory::new(
        FakeRecognizer::replying("what's the weather"),
        FakeReasoner::slow("Sunny.", Duration::from_secs(20)),
        FakeSynthesizer::new(5, Duration::from_millis(FRAME_MS)),
    );
    let mut config = quiet_config();
    config.timeouts.reasoning = Duration::from_secs(2);
    let fallback = config.fallback_message.clone();
    let mut harness = Harness::start(&factory, config);

    harness.feed(utterance_frames(400, 700)).await?;
    let error = harness
        .until(|k| matches!(k, SessionEventKind::RecoverableError { .. }))
        .await?;
    let response = harness
        .until(|k| matches!(k, SessionEventKind::Response { .. }))
        .await?;
    harness.until_state(TurnState::Listening).await?;

    let (exit, history, _) = harness.stop().await?;

    // Verify: fallback spoken, session keeps running
    assert!(matches!(
        error,
        SessionEventKind::RecoverableError {
            stage: Stage::Reasoning,
            ..
        }
    ));
    assert_eq!(
        response,
        SessionEventKind::Response {
            text: fallback.clone(),
            fallback: true
        }
    );
    assert_eq!(factory.synthesizer.spoken(), vec![fallback]);
    assert_eq!(exit, PipelineExit::Stopped);
    assert_eq!(history, vec![(Role::User, "what's the weather".to_string())]);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_recognition_failure_returns_to_listening() -> Result<()> {
    let factory = FakeProviderFactory::new(
        FakeRecognizer::failing(),
        FakeReasoner::replying("unused"),
        FakeSynthesizer::new(5, Duration::from_millis(FRAME_MS)),
    );
    let mut harness = Harness::start(&factory, quiet_config());

    harness.feed(utterance_frames(400, 700)).await?;
    let error = harness
        .until(|k| matches!(k, SessionEventKind::RecoverableError { .. }))
        .await?;
    harness.until_state(TurnState::Listening).await?;

    let (_, _, log) = harness.stop().await?;
    assert!(matches!(
        error,
        SessionEventKind::RecoverableError {
            stage: Stage::Recognition,
            ..
        }
    ));
    assert_eq!(
        state_path(&log),
        vec![TurnState::Transcribing, TurnState::Listening]
    );
    assert_eq!(factory.reasoner.calls(), 0);
    assert_eq!(factory.synthesizer.counters.started(), 0);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_empty_transcript_skips_reasoning() -> Result<()> {
    let factory = FakeProviderFactory::new(
        FakeRecognizer::replying("   "),
        FakeReasoner::replying("unused"),
        FakeSynthesizer::new(5, Duration::from_millis(FRAME_MS)),
    );
    let mut harness = Harness::start(&factory, quiet_config());

    harness.feed(utterance_frames(400, 700)).await?;
    harness.until_state(TurnState::Listening).await?;

    let (_, _, log) = harness.stop().await?;
    assert!(!log
        .iter()
        .any(|k| matches!(k, SessionEventKind::Transcript { .. })));
    assert_eq!(factory.reasoner.calls(), 0);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_greeting_spoken_first() -> Result<()> {
    let factory = FakeProviderFactory::conversational();
    let config = PipelineConfig {
        greeting: Some("Hello! How can I help?".to_string()),
        ..Default::default()
    };
    let mut harness = Harness::start(&factory, config);

    harness.until_state(TurnState::Listening).await?;
    let (_, history, log) = harness.stop().await?;

    assert_eq!(state_path(&log), vec![TurnState::Speaking, TurnState::Listening]);
    assert_eq!(factory.synthesizer.spoken(), vec!["Hello! How can I help?".to_string()]);
    assert_eq!(
        history,
        vec![(Role::Assistant, "Hello! How can I help?".to_string())]
    );

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_idle_timeout_without_utterance() -> Result<()> {
    let factory = FakeProviderFactory::conversational();
    let config = PipelineConfig {
        idle_timeout: Duration::from_secs(5),
        ..quiet_config()
    };
    let harness = Harness::start(&factory, config);

    // Silence does not count as activity
    let input = harness.input.clone();
    tokio::spawn(async move {
        for i in 0..1000 {
            if input.send(silence_frame(i * FRAME_MS)).await.is_err() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(FRAME_MS)).await;
        }
    });

    let (exit, _) = tokio::time::timeout(Duration::from_secs(10), harness.task).await??;
    assert_eq!(exit, PipelineExit::IdleTimeout);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_idle_window_restarts_after_long_reply() -> Result<()> {
    // Setup: the reply plays for 3s, longer than the 1s idle window
    let factory = FakeProviderFactory::new(
        FakeRecognizer::replying("hello"),
        FakeReasoner::replying("A long answer"),
        FakeSynthesizer::new(150, Duration::from_millis(FRAME_MS)),
    );
    let config = PipelineConfig {
        idle_timeout: Duration::from_secs(1),
        ..quiet_config()
    };
    let mut harness = Harness::start(&factory, config);

    harness.feed(utterance_frames(400, 700)).await?;
    harness.until_state(TurnState::Speaking).await?;
    harness.until_state(TurnState::Listening).await?;
    let listening_at = tokio::time::Instant::now();

    // Verify: the session survives the reply and idles out a full window later
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(!harness.task.is_finished());

    let (exit, _) = tokio::time::timeout(Duration::from_secs(5), harness.task).await??;
    assert_eq!(exit, PipelineExit::IdleTimeout);
    assert!(listening_at.elapsed() >= Duration::from_secs(1));
    assert_eq!(factory.synthesizer.counters.completed(), 1);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_cancel_while_speaking_releases_synthesis() -> Result<()> {
    let factory = FakeProviderFactory::new(
        FakeRecognizer::replying("hello"),
        FakeReasoner::replying("A very long answer"),
        FakeSynthesizer::new(500, Duration::from_millis(FRAME_MS)),
    );
    let mut harness = Harness::start(&factory, quiet_config());

    harness.feed(utterance_frames(400, 700)).await?;
    harness.until_state(TurnState::Speaking).await?;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let sink = Arc::clone(&harness.sink);
    let (exit, _, _) = harness.stop().await?;

    assert_eq!(exit, PipelineExit::Stopped);
    assert_eq!(factory.synthesizer.counters.released(), 1);
    assert_eq!(factory.synthesizer.counters.completed(), 0);
    assert_eq!(sink.clears.load(Ordering::SeqCst), 1);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_input_closed_ends_pipeline() -> Result<()> {
    let factory = FakeProviderFactory::conversational();
    let Harness { input, task, .. } = Harness::start(&factory, quiet_config());

    drop(input);
    let (exit, _) = task.await?;
    assert_eq!(exit, PipelineExit::InputClosed);

    Ok(())
}
