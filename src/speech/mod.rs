//! Spoken announcements
//!
//! One ordered queue drained by a worker thread. `say_now` flushes anything
//! still waiting and takes its place; `say_queued` appends. Engine failures
//! are logged and dropped.

use crossbeam_channel::{unbounded, Receiver, Sender};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum SpeechError {
    #[error("speech engine is not available")]
    Unavailable,
    #[error("speech engine failed: {0}")]
    Engine(String),
}

/// Where the pipeline sends announcements
pub trait SpeechSink: Send {
    /// Interrupt anything queued and speak `text` next
    fn say_now(&self, text: &str);
    /// Speak `text` after everything already queued
    fn say_queued(&self, text: &str);
}

/// Something that can actually speak
pub trait SpeechEngine: Send {
    fn speak(&mut self, text: &str) -> Result<(), SpeechError>;
}

/// Writes utterances to the log
pub struct LogSpeech;

impl SpeechEngine for LogSpeech {
    fn speak(&mut self, text: &str) -> Result<(), SpeechError> {
        info!(target: "speech", "{}", text);
        Ok(())
    }
}

/// Runs an external program with the text as its last argument
pub struct CommandSpeech {
    program: String,
}

impl CommandSpeech {
    pub fn new(program: impl Into<String>) -> Self {
        Self { program: program.into() }
    }
}

impl SpeechEngine for CommandSpeech {
    fn speak(&mut self, text: &str) -> Result<(), SpeechError> {
        let status = std::process::Command::new(&self.program)
            .arg(text)
            .status()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => SpeechError::Unavailable,
                _ => SpeechError::Engine(e.to_string()),
            })?;

        if status.success() {
            Ok(())
        } else {
            Err(SpeechError::Engine(format!("{} exited with {}", self.program, status)))
        }
    }
}

/// Discards everything
#[derive(Debug, Clone, Copy, Default)]
pub struct Silent;

impl SpeechSink for Silent {
    fn say_now(&self, _text: &str) {}
    fn say_queued(&self, _text: &str) {}
}

enum SpeechMessage {
    Say { text: String, generation: u64 },
    Stop,
}

/// Cheap handle for enqueueing utterances
#[derive(Clone)]
pub struct SpeechHandle {
    tx: Sender<SpeechMessage>,
    flush: Arc<AtomicU64>,
}

impl SpeechSink for SpeechHandle {
    fn say_now(&self, text: &str) {
        let generation = self.flush.fetch_add(1, Ordering::SeqCst) + 1;
        let _ = self.tx.send(SpeechMessage::Say { text: text.to_string(), generation });
    }

    fn say_queued(&self, text: &str) {
        let generation = self.flush.load(Ordering::SeqCst);
        let _ = self.tx.send(SpeechMessage::Say { text: text.to_string(), generation });
    }
}

/// Owns the speech worker thread
pub struct SpeechQueue {
    handle: SpeechHandle,
    worker: Option<JoinHandle<()>>,
}

impl SpeechQueue {
    pub fn start(engine: Box<dyn SpeechEngine>) -> Self {
        let (tx, rx) = unbounded();
        let flush = Arc::new(AtomicU64::new(0));
        let worker_flush = flush.clone();

        let worker = std::thread::Builder::new()
            .name("speech".into())
            .spawn(move || run_worker(rx, worker_flush, engine))
            .map_err(|e| debug!("Speech worker failed to start: {}", e))
            .ok();

        Self {
            handle: SpeechHandle { tx, flush },
            worker,
        }
    }

    pub fn handle(&self) -> SpeechHandle {
        self.handle.clone()
    }
}

impl Drop for SpeechQueue {
    fn drop(&mut self) {
        let _ = self.handle.tx.send(SpeechMessage::Stop);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn run_worker(rx: Receiver<SpeechMessage>, flush: Arc<AtomicU64>, mut engine: Box<dyn SpeechEngine>) {
    for message in rx {
        match message {
            SpeechMessage::Say { text, generation } => {
                // flushed by a later say_now
                if generation < flush.load(Ordering::SeqCst) {
                    debug!("Speech flushed: {}", text);
                    continue;
                }
                if let Err(e) = engine.speak(&text) {
                    debug!("Speech dropped ({}): {}", e, text);
                }
            }
            SpeechMessage::Stop => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;
    use parking_lot::Mutex;

    /// Blocks on the first utterance until released
    struct GatedEngine {
        spoken: Arc<Mutex<Vec<String>>>,
        started: Sender<()>,
        gate: Receiver<()>,
    }

    impl SpeechEngine for GatedEngine {
        fn speak(&mut self, text: &str) -> Result<(), SpeechError> {
            if self.spoken.lock().is_empty() {
                let _ = self.started.send(());
                let _ = self.gate.recv();
            }
            self.spoken.lock().push(text.to_string());
            Ok(())
        }
    }

    struct FailingEngine;

    impl SpeechEngine for FailingEngine {
        fn speak(&mut self, _text: &str) -> Result<(), SpeechError> {
            Err(SpeechError::Unavailable)
        }
    }

    #[test]
    fn test_say_now_flushes_waiting_utterances() {
        let spoken = Arc::new(Mutex::new(Vec::new()));
        let (started_tx, started_rx) = bounded(1);
        let (gate_tx, gate_rx) = bounded(1);
        let queue = SpeechQueue::start(Box::new(GatedEngine {
            spoken: spoken.clone(),
            started: started_tx,
            gate: gate_rx,
        }));
        let speech = queue.handle();

        speech.say_queued("first");
        started_rx.recv().unwrap();

        speech.say_queued("second");
        speech.say_queued("third");
        speech.say_now("urgent");
        speech.say_queued("after");
        gate_tx.send(()).unwrap();

        drop(queue);
        assert_eq!(*spoken.lock(), vec!["first", "urgent", "after"]);
    }

    #[test]
    fn test_queued_utterances_keep_order() {
        let spoken = Arc::new(Mutex::new(Vec::new()));
        let (started_tx, _started_rx) = bounded(1);
        let (gate_tx, gate_rx) = bounded(1);
        gate_tx.send(()).unwrap();
        let queue = SpeechQueue::start(Box::new(GatedEngine {
            spoken: spoken.clone(),
            started: started_tx,
            gate: gate_rx,
        }));

        let speech = queue.handle();
        for text in ["a", "b", "c"] {
            speech.say_queued(text);
        }

        drop(queue);
        assert_eq!(*spoken.lock(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_engine_failure_is_not_fatal() {
        let queue = SpeechQueue::start(Box::new(FailingEngine));
        queue.handle().say_now("hello");
        queue.handle().say_queued("world");
        drop(queue);
    }

    #[test]
    fn test_missing_program_is_unavailable() {
        let mut engine = CommandSpeech::new("sight-assist-no-such-speech-program");
        assert!(matches!(engine.speak("hi"), Err(SpeechError::Unavailable)));
    }
}
