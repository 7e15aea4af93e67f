//! Progressive-edit accumulator for streamed sandbox output.
//!
//! One accumulator per sandbox invocation. Tool starts and text deltas are
//! coalesced by a debounce timer into at most one channel write per
//! interval; the first write is a `send` (capturing the message id), later
//! writes are `edit`s of that message. All writes happen on a single worker
//! task, so the final edit always observes every earlier write.

use std::sync::Arc;
use std::time::Duration;

use relay_core::error::RelayError;
use relay_core::protocol::StreamEvent;
use relay_core::traits::Channel;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Cap on captured tool-start lines; the surplus becomes one counter line.
const MAX_TOOL_LINES: usize = 20;

/// Debounce window between intermediate channel writes.
const DEBOUNCE: Duration = Duration::from_millis(500);

enum Op {
    Event(StreamEvent),
    Finalize {
        result: Option<String>,
        done: oneshot::Sender<FinalizeReport>,
    },
}

/// What `finalize` accomplished.
#[derive(Debug, Clone, Default)]
pub struct FinalizeReport {
    /// A user-visible message was sent or edited at some point.
    pub delivered: bool,
    /// The text that ended up user-visible, after internal blocks were
    /// stripped. Empty when nothing was delivered.
    pub final_text: String,
}

/// Handle to a running accumulator worker.
pub struct StreamAccumulator {
    tx: mpsc::Sender<Op>,
}

impl StreamAccumulator {
    pub fn spawn(channel: Arc<dyn Channel>, jid: String) -> Self {
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(worker(channel, jid, rx));
        Self { tx }
    }

    /// Feed one streamed event. Ordering follows call order.
    pub async fn push_event(&self, event: StreamEvent) {
        let _ = self.tx.send(Op::Event(event)).await;
    }

    /// Finish the invocation: strip internal reasoning, then edit the
    /// progressive message into its final form (or send once). `result` is
    /// the sandbox's final reply; `None` falls back to accumulated text.
    pub async fn finalize(&self, result: Option<String>) -> FinalizeReport {
        let (done, rx) = oneshot::channel();
        if self.tx.send(Op::Finalize { result, done }).await.is_err() {
            return FinalizeReport::default();
        }
        rx.await.unwrap_or_default()
    }
}

struct WorkerState {
    tool_lines: Vec<String>,
    extra_tools: usize,
    text: String,
    message_id: Option<String>,
    delivered: bool,
    last_rendered: String,
}

impl WorkerState {
    fn new() -> Self {
        Self {
            tool_lines: Vec::new(),
            extra_tools: 0,
            text: String::new(),
            message_id: None,
            delivered: false,
            last_rendered: String::new(),
        }
    }

    fn apply(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::ToolStart {
                tool_name,
                tool_input,
            } => {
                if self.tool_lines.len() >= MAX_TOOL_LINES {
                    self.extra_tools += 1;
                    return;
                }
                let name = tool_name.unwrap_or_else(|| "tool".into());
                let line = match tool_input.filter(|i| !i.is_empty()) {
                    Some(input) => format!("⚙ {name}: {}", first_line(&input, 80)),
                    None => format!("⚙ {name}"),
                };
                self.tool_lines.push(line);
            }
            StreamEvent::TextDelta { text } => {
                if let Some(t) = text {
                    self.text.push_str(&t);
                }
            }
        }
    }

    fn render(&self, max_len: usize) -> String {
        let mut out = String::new();
        for line in &self.tool_lines {
            out.push_str(line);
            out.push('\n');
        }
        if self.extra_tools > 0 {
            out.push_str(&format!("⚙ +{} more tools\n", self.extra_tools));
        }
        if !self.text.is_empty() {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(&self.text);
        }
        let out = out.trim_end().to_string();
        if out.chars().count() > max_len {
            out.chars().take(max_len).collect()
        } else {
            out
        }
    }
}

async fn worker(channel: Arc<dyn Channel>, jid: String, mut rx: mpsc::Receiver<Op>) {
    let mut state = WorkerState::new();
    let mut dirty = false;
    let flush_timer = tokio::time::sleep(DEBOUNCE);
    tokio::pin!(flush_timer);

    loop {
        tokio::select! {
            op = rx.recv() => match op {
                None => return,
                Some(Op::Event(event)) => {
                    state.apply(event);
                    if !dirty {
                        dirty = true;
                        flush_timer.as_mut().reset(tokio::time::Instant::now() + DEBOUNCE);
                    }
                }
                Some(Op::Finalize { result, done }) => {
                    let report = finalize(&channel, &jid, &mut state, result).await;
                    let _ = done.send(report);
                    return;
                }
            },
            _ = &mut flush_timer, if dirty => {
                dirty = false;
                if let Err(e) = flush(&channel, &jid, &mut state).await {
                    warn!(jid = jid.as_str(), err = %e, "progressive flush failed");
                }
            }
        }
    }
}

/// One intermediate write. Channels without editing buffer until finalize.
async fn flush(
    channel: &Arc<dyn Channel>,
    jid: &str,
    state: &mut WorkerState,
) -> Result<(), RelayError> {
    if !channel.supports_edit() {
        return Ok(());
    }
    let rendered = state.render(channel.max_text_len());
    if rendered.is_empty() || rendered == state.last_rendered {
        return Ok(());
    }

    match &state.message_id {
        None => {
            let id = channel.send(jid, &rendered).await?;
            state.message_id = id;
            state.delivered = true;
        }
        Some(id) => {
            channel.edit(jid, id, &rendered).await?;
        }
    }
    state.last_rendered = rendered;
    Ok(())
}

async fn finalize(
    channel: &Arc<dyn Channel>,
    jid: &str,
    state: &mut WorkerState,
    result: Option<String>,
) -> FinalizeReport {
    let raw = result.unwrap_or_else(|| state.text.clone());
    let clean = strip_internal_blocks(&raw);

    if clean.is_empty() {
        return FinalizeReport {
            delivered: state.delivered,
            final_text: String::new(),
        };
    }

    let fits = clean.chars().count() <= channel.max_text_len();
    let outcome = match (&state.message_id, fits) {
        (Some(id), true) => {
            if clean == state.last_rendered {
                Ok(())
            } else {
                channel.edit(jid, id, &clean).await.map(|_| ())
            }
        }
        // Oversize finals cannot replace the progress message; send fresh so
        // nothing is lost to truncation.
        (Some(_), false) | (None, _) => channel.send(jid, &clean).await.map(|_| ()),
    };

    match outcome {
        Ok(()) => {
            debug!(jid, len = clean.len(), "final reply delivered");
            FinalizeReport {
                delivered: true,
                final_text: clean,
            }
        }
        Err(e) => {
            warn!(jid, err = %e, "failed to deliver final reply");
            FinalizeReport {
                delivered: state.delivered,
                final_text: String::new(),
            }
        }
    }
}

/// Remove `<internal>…</internal>` reasoning spans from agent output.
pub fn strip_internal_blocks(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("<internal>") {
        out.push_str(&rest[..start]);
        match rest[start..].find("</internal>") {
            Some(end) => rest = &rest[start + end + "</internal>".len()..],
            None => {
                rest = "";
                break;
            }
        }
    }
    out.push_str(rest);
    out.trim().to_string()
}

fn first_line(text: &str, max: usize) -> String {
    let line = text.lines().next().unwrap_or_default();
    if line.chars().count() > max {
        let mut out: String = line.chars().take(max).collect();
        out.push('…');
        out
    } else {
        line.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Send(String),
        Edit(String, String),
    }

    struct MockChannel {
        calls: Mutex<Vec<Call>>,
        can_edit: bool,
        max_len: usize,
    }

    impl MockChannel {
        fn new(can_edit: bool, max_len: usize) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                can_edit,
                max_len,
            })
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Channel for MockChannel {
        fn name(&self) -> &str {
            "mock"
        }
        fn owns(&self, _jid: &str) -> bool {
            true
        }
        fn max_text_len(&self) -> usize {
            self.max_len
        }
        fn supports_edit(&self) -> bool {
            self.can_edit
        }
        async fn send(&self, _jid: &str, text: &str) -> Result<Option<String>, RelayError> {
            let mut calls = self.calls.lock().unwrap();
            calls.push(Call::Send(text.to_string()));
            Ok(Some(format!("m{}", calls.len())))
        }
        async fn edit(&self, _jid: &str, id: &str, text: &str) -> Result<bool, RelayError> {
            self.calls
                .lock()
                .unwrap()
                .push(Call::Edit(id.to_string(), text.to_string()));
            Ok(true)
        }
    }

    fn delta(text: &str) -> StreamEvent {
        StreamEvent::TextDelta {
            text: Some(text.to_string()),
        }
    }

    fn tool(name: &str) -> StreamEvent {
        StreamEvent::ToolStart {
            tool_name: Some(name.to_string()),
            tool_input: None,
        }
    }

    #[tokio::test]
    async fn first_write_sends_then_edits() {
        let channel = MockChannel::new(true, 4096);
        let acc = StreamAccumulator::spawn(channel.clone(), "tg:1".into());

        acc.push_event(tool("Read")).await;
        tokio::time::sleep(DEBOUNCE + Duration::from_millis(100)).await;
        acc.push_event(delta("Hello")).await;
        tokio::time::sleep(DEBOUNCE + Duration::from_millis(100)).await;

        let report = acc.finalize(Some("Hello world".into())).await;
        assert!(report.delivered);
        assert_eq!(report.final_text, "Hello world");

        let calls = channel.calls();
        assert!(matches!(&calls[0], Call::Send(t) if t.contains("Read")));
        assert!(matches!(&calls[1], Call::Edit(id, _) if id == "m1"));
        assert!(matches!(calls.last().unwrap(), Call::Edit(id, t) if id == "m1" && t == "Hello world"));
    }

    #[tokio::test]
    async fn debounce_coalesces_bursts() {
        let channel = MockChannel::new(true, 4096);
        let acc = StreamAccumulator::spawn(channel.clone(), "tg:1".into());

        for i in 0..10 {
            acc.push_event(delta(&format!("chunk{i} "))).await;
        }
        tokio::time::sleep(DEBOUNCE + Duration::from_millis(100)).await;

        // Ten deltas, one write.
        assert_eq!(channel.calls().len(), 1);
    }

    #[tokio::test]
    async fn non_editing_channel_gets_single_final_send() {
        let channel = MockChannel::new(false, 4096);
        let acc = StreamAccumulator::spawn(channel.clone(), "tg:1".into());

        acc.push_event(tool("Bash")).await;
        acc.push_event(delta("working...")).await;
        tokio::time::sleep(DEBOUNCE + Duration::from_millis(100)).await;

        let report = acc.finalize(Some("done".into())).await;
        assert!(report.delivered);
        assert_eq!(channel.calls(), vec![Call::Send("done".into())]);
    }

    #[tokio::test]
    async fn tool_lines_capped_with_more_marker() {
        let channel = MockChannel::new(true, 1_000_000);
        let acc = StreamAccumulator::spawn(channel.clone(), "tg:1".into());

        for i in 0..25 {
            acc.push_event(tool(&format!("Tool{i}"))).await;
        }
        tokio::time::sleep(DEBOUNCE + Duration::from_millis(100)).await;

        let calls = channel.calls();
        let Call::Send(text) = &calls[0] else {
            panic!("expected a send");
        };
        assert!(text.contains("Tool0"));
        assert!(text.contains("Tool19"));
        assert!(!text.contains("Tool20"));
        assert!(text.contains("+5 more tools"));
    }

    #[tokio::test]
    async fn oversize_final_falls_back_to_fresh_send() {
        let channel = MockChannel::new(true, 50);
        let acc = StreamAccumulator::spawn(channel.clone(), "tg:1".into());

        acc.push_event(delta("partial")).await;
        tokio::time::sleep(DEBOUNCE + Duration::from_millis(100)).await;

        let long = "x".repeat(200);
        let report = acc.finalize(Some(long.clone())).await;
        assert!(report.delivered);
        let calls = channel.calls();
        assert!(matches!(calls.last().unwrap(), Call::Send(t) if t.len() == 200));
    }

    #[tokio::test]
    async fn finalize_strips_internal_blocks() {
        let channel = MockChannel::new(true, 4096);
        let acc = StreamAccumulator::spawn(channel.clone(), "tg:1".into());
        let report = acc
            .finalize(Some("Answer <internal>chain of thought</internal> here".into()))
            .await;
        assert_eq!(report.final_text, "Answer  here");
        assert!(!report.final_text.contains("chain"));
    }

    #[tokio::test]
    async fn empty_finalize_reports_undelivered() {
        let channel = MockChannel::new(true, 4096);
        let acc = StreamAccumulator::spawn(channel.clone(), "tg:1".into());
        let report = acc.finalize(None).await;
        assert!(!report.delivered);
        assert!(channel.calls().is_empty());
    }

    #[test]
    fn strip_internal_variants() {
        assert_eq!(strip_internal_blocks("plain"), "plain");
        assert_eq!(
            strip_internal_blocks("a <internal>x</internal> b <internal>y</internal> c"),
            "a  b  c"
        );
        assert_eq!(strip_internal_blocks("head <internal>never closed"), "head");
        assert_eq!(
            strip_internal_blocks("<internal>\nmulti\nline\n</internal>tail"),
            "tail"
        );
    }
}
