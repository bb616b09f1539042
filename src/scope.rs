use std::sync::{Arc, Mutex};

use crate::llm::CompressionLlm;
use crate::manager::MemoryManager;
use crate::types::Message;

/// Hierarchy level a `ScopedView` occupies. Each level sees its own local
/// messages plus, on request, a one-line summary inherited from its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryScope {
    Global,
    Exploration,
    Execution,
    Step,
}

impl MemoryScope {
    fn label(self) -> &'static str {
        match self {
            MemoryScope::Global => "Global",
            MemoryScope::Exploration => "Exploration",
            MemoryScope::Execution => "Execution",
            MemoryScope::Step => "Step",
        }
    }
}

struct ScopedViewState {
    local_messages: Vec<Message>,
    scope_summary: Option<String>,
}

/// A non-duplicating view into a subtree of a run: exploration loops spawn
/// execution scopes, which spawn per-step scopes, each accumulating its own
/// messages while still able to pull a compact summary of what came before
/// it without copying the parent's whole history (spec §4.5).
///
/// Parents are referenced, never owned: a `ScopedView` holds an `Arc` to the
/// parent it was created from rather than a reference into the
/// `MemoryManager`, so child scopes can outlive the call that created them.
/// Committing a scope's summary back into long-term memory is the one
/// operation that needs the manager, and it's threaded in as an explicit
/// `&mut MemoryManager` argument rather than stored.
pub struct ScopedView {
    scope: MemoryScope,
    state: Mutex<ScopedViewState>,
    parent: Option<Arc<ScopedView>>,
}

impl ScopedView {
    pub fn new_root(scope: MemoryScope) -> Arc<Self> {
        Arc::new(Self {
            scope,
            state: Mutex::new(ScopedViewState {
                local_messages: Vec::new(),
                scope_summary: None,
            }),
            parent: None,
        })
    }

    pub fn new_child(self: &Arc<Self>, scope: MemoryScope) -> Arc<Self> {
        Arc::new(Self {
            scope,
            state: Mutex::new(ScopedViewState {
                local_messages: Vec::new(),
                scope_summary: None,
            }),
            parent: Some(Arc::clone(self)),
        })
    }

    pub fn scope(&self) -> MemoryScope {
        self.scope
    }

    pub fn add_message(&self, message: Message) {
        self.state.lock().unwrap().local_messages.push(message);
    }

    pub fn get_messages(&self) -> Vec<Message> {
        self.state.lock().unwrap().local_messages.clone()
    }

    /// Local messages, optionally prefixed with a `[Previous Context]`
    /// message carrying the parent scope's summary.
    pub fn get_context(&self, include_parent: bool) -> Vec<Message> {
        let mut context = Vec::new();
        if include_parent {
            if let Some(parent) = &self.parent {
                let summary = parent.get_summary();
                if !summary.is_empty() {
                    context.push(Message::user(format!("[Previous Context]\n{summary}")));
                }
            }
        }
        context.extend(self.get_messages());
        context
    }

    /// An explicitly-set summary, or a best-effort one built from the last
    /// five local messages, truncated to 200 characters each.
    pub fn get_summary(&self) -> String {
        let state = self.state.lock().unwrap();
        if let Some(summary) = &state.scope_summary {
            return summary.clone();
        }
        if state.local_messages.is_empty() {
            return String::new();
        }
        state
            .local_messages
            .iter()
            .rev()
            .take(5)
            .rev()
            .map(|m| {
                let text = m.extract_text();
                let truncated = if text.chars().count() > 200 {
                    let head: String = text.chars().take(200).collect();
                    format!("{head}...")
                } else {
                    text
                };
                format!("{:?}: {truncated}", m.role)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn set_summary(&self, summary: impl Into<String>) {
        self.state.lock().unwrap().scope_summary = Some(summary.into());
    }

    /// Writes this scope's summary into the manager's short-term buffer as
    /// an assistant message, so it survives once this view is dropped.
    pub async fn commit_to_global(&self, manager: &mut MemoryManager, llm: &dyn CompressionLlm) {
        let summary = self.get_summary();
        if summary.is_empty() {
            return;
        }
        let label = self.scope.label();
        manager
            .add_message(llm, Message::assistant(format!("[{label} Summary]\n{summary}")), None)
            .await;
    }

    pub fn clear(&self) {
        let mut state = self.state.lock().unwrap();
        state.local_messages.clear();
        state.scope_summary = None;
    }

    pub fn message_count(&self) -> usize {
        self.state.lock().unwrap().local_messages.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfig;
    use crate::llm::test_support::MockLlm;

    #[test]
    fn child_inherits_parent_summary_in_context() {
        let root = ScopedView::new_root(MemoryScope::Exploration);
        root.add_message(Message::user("explored option A"));
        root.set_summary("Explored option A, chose to pursue it.");

        let child = root.new_child(MemoryScope::Execution);
        child.add_message(Message::user("executing option A"));

        let context = child.get_context(true);
        assert_eq!(context.len(), 2);
        assert!(context[0].extract_text().contains("Explored option A"));
        assert!(context[1].extract_text().contains("executing option A"));
    }

    #[test]
    fn get_context_without_parent_omits_prefix() {
        let root = ScopedView::new_root(MemoryScope::Global);
        root.set_summary("irrelevant since no parent");
        let child = root.new_child(MemoryScope::Step);
        child.add_message(Message::user("step work"));
        let context = child.get_context(false);
        assert_eq!(context.len(), 1);
    }

    #[test]
    fn auto_summary_falls_back_to_recent_messages() {
        let view = ScopedView::new_root(MemoryScope::Step);
        for i in 0..8 {
            view.add_message(Message::user(format!("msg {i}")));
        }
        let summary = view.get_summary();
        assert!(summary.contains("msg 7"));
        assert!(!summary.contains("msg 0"), "only the last 5 messages should appear");
    }

    #[test]
    fn clear_resets_messages_and_summary() {
        let view = ScopedView::new_root(MemoryScope::Step);
        view.add_message(Message::user("a"));
        view.set_summary("explicit");
        view.clear();
        assert_eq!(view.message_count(), 0);
        assert_eq!(view.get_summary(), "");
    }

    #[tokio::test]
    async fn commit_to_global_writes_assistant_summary() {
        let view = ScopedView::new_root(MemoryScope::Execution);
        view.set_summary("ran three tool calls successfully");
        let mut manager = MemoryManager::new(MemoryConfig::default(), "anthropic", "claude-3-5-sonnet-20241022");
        let llm = MockLlm::new("unused");
        view.commit_to_global(&mut manager, &llm).await;

        let context = manager.get_context_for_llm();
        assert!(context.iter().any(|m| m.extract_text().contains("Execution Summary")));
    }

    #[tokio::test]
    async fn commit_to_global_is_noop_when_summary_empty() {
        let view = ScopedView::new_root(MemoryScope::Step);
        let mut manager = MemoryManager::new(MemoryConfig::default(), "anthropic", "claude-3-5-sonnet-20241022");
        let llm = MockLlm::new("unused");
        view.commit_to_global(&mut manager, &llm).await;
        assert!(manager.get_context_for_llm().is_empty());
    }
}
