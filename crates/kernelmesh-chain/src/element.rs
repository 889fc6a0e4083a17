//! Two-phase Request/Close stages and their composition.
//!
//! A stage's `request` first hands the connection to the rest of the
//! pipeline and only then applies its own effect. Effects are therefore
//! applied innermost first, and `close` walks the pipeline in the opposite
//! direction.

use std::sync::Arc;

use kernelmesh_common::context::Context;
use kernelmesh_common::error::{KernelmeshError, Result};
use kernelmesh_common::types::Connection;

/// One stage of the connection pipeline.
pub trait Element: Send + Sync {
    /// Short stage name used in logs.
    fn name(&self) -> &'static str;

    /// Builds the connection through `next`, then applies this stage's effect.
    ///
    /// A stage whose own effect fails must undo it and close the remainder
    /// it already built (see [`rollback`]) before returning the error.
    ///
    /// # Errors
    ///
    /// Returns the first failure, with compensation failures appended.
    fn request(&self, ctx: &Context, conn: Connection, next: Next<'_>) -> Result<Connection>;

    /// Undoes this stage's effect, then always closes `next`.
    ///
    /// Must succeed as a no-op when there is nothing to undo.
    ///
    /// # Errors
    ///
    /// Returns the local error, the downstream error, or both merged.
    fn close(&self, ctx: &Context, conn: &mut Connection, next: Next<'_>) -> Result<()>;
}

/// Handle to the rest of the pipeline.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    elements: &'a [Arc<dyn Element>],
    tail: Option<&'a Next<'a>>,
}

impl<'a> Next<'a> {
    /// The empty remainder: requests return the connection unchanged.
    #[must_use]
    pub const fn end() -> Self {
        Self {
            elements: &[],
            tail: None,
        }
    }

    const fn new(elements: &'a [Arc<dyn Element>], tail: Option<&'a Next<'a>>) -> Self {
        Self { elements, tail }
    }

    /// Requests `conn` through the remaining stages.
    ///
    /// # Errors
    ///
    /// Returns the error of the first failing stage.
    pub fn request(self, ctx: &Context, conn: Connection) -> Result<Connection> {
        match self.elements.split_first() {
            Some((head, rest)) => head.request(ctx, conn, Next::new(rest, self.tail)),
            None => match self.tail {
                Some(tail) => tail.request(ctx, conn),
                None => Ok(conn),
            },
        }
    }

    /// Closes `conn` through the remaining stages.
    ///
    /// # Errors
    ///
    /// Returns the merged errors of the remaining stages.
    pub fn close(self, ctx: &Context, conn: &mut Connection) -> Result<()> {
        match self.elements.split_first() {
            Some((head, rest)) => head.close(ctx, conn, Next::new(rest, self.tail)),
            None => self.tail.map_or(Ok(()), |tail| tail.close(ctx, conn)),
        }
    }
}

impl std::fmt::Debug for Next<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Next")
            .field(
                "elements",
                &self.elements.iter().map(|e| e.name()).collect::<Vec<_>>(),
            )
            .field("tail", &self.tail.is_some())
            .finish()
    }
}

/// An ordered sequence of stages, itself usable as a stage.
#[derive(Clone, Default)]
pub struct Chain {
    elements: Vec<Arc<dyn Element>>,
}

impl Chain {
    /// Creates a chain from stages listed outermost first.
    #[must_use]
    pub fn new(elements: Vec<Arc<dyn Element>>) -> Self {
        Self { elements }
    }

    /// Number of stages directly in this chain.
    #[must_use]
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    /// Returns `true` if the chain has no stages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Runs `conn` through every stage.
    ///
    /// # Errors
    ///
    /// Returns the first stage failure after the applied stages were closed.
    pub fn apply(&self, ctx: &Context, conn: Connection) -> Result<Connection> {
        tracing::debug!(id = %conn.id, stages = self.elements.len(), "request");
        Next::new(&self.elements, None).request(ctx, conn)
    }

    /// Closes `conn` through every stage.
    ///
    /// # Errors
    ///
    /// Returns the merged stage failures. Every stage is visited regardless.
    pub fn teardown(&self, ctx: &Context, conn: &mut Connection) -> Result<()> {
        tracing::debug!(id = %conn.id, stages = self.elements.len(), "close");
        Next::new(&self.elements, None).close(ctx, conn)
    }
}

impl std::fmt::Debug for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.elements.iter().map(|e| e.name()))
            .finish()
    }
}

impl Element for Chain {
    fn name(&self) -> &'static str {
        "chain"
    }

    fn request(&self, ctx: &Context, conn: Connection, next: Next<'_>) -> Result<Connection> {
        Next::new(&self.elements, Some(&next)).request(ctx, conn)
    }

    fn close(&self, ctx: &Context, conn: &mut Connection, next: Next<'_>) -> Result<()> {
        Next::new(&self.elements, Some(&next)).close(ctx, conn)
    }
}

/// Compensates a stage whose own effect failed after `next` succeeded.
///
/// Runs `undo` for the stage's partial effect, then sends exactly one close
/// down `next`, both under a postponed context. Returns `cause`, with any
/// compensation failures appended.
pub fn rollback<F>(
    stage: &'static str,
    ctx: &Context,
    conn: &mut Connection,
    next: Next<'_>,
    cause: KernelmeshError,
    undo: F,
) -> KernelmeshError
where
    F: FnOnce(&Context) -> Result<()>,
{
    tracing::warn!(stage, id = %conn.id, error = %cause, "request failed, rolling back");
    let close_ctx = ctx.postpone();
    let mut close_errors = Vec::new();
    if let Err(e) = undo(&close_ctx) {
        close_errors.push(e);
    }
    if let Err(e) = next.close(&close_ctx, conn) {
        close_errors.push(e);
    }
    if !close_errors.is_empty() {
        tracing::error!(stage, id = %conn.id, failures = close_errors.len(), "rollback incomplete");
    }
    cause.with_close_errors(&close_errors)
}

/// Combines the outcome of a stage's local close with the downstream close.
///
/// # Errors
///
/// Returns the local error first, with a downstream error appended.
pub fn finish_close(local: Result<()>, downstream: Result<()>) -> Result<()> {
    match (local, downstream) {
        (Ok(()), Ok(())) => Ok(()),
        (Err(e), Ok(())) | (Ok(()), Err(e)) => Err(e),
        (Err(local), Err(downstream)) => Err(local.with_close_errors(&[downstream])),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Stage that records its effects into a shared journal.
    struct Recorder {
        id: usize,
        journal: Arc<Mutex<Vec<String>>>,
        fail_request: bool,
        fail_close: bool,
    }

    impl Recorder {
        fn new(id: usize, journal: &Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                id,
                journal: Arc::clone(journal),
                fail_request: false,
                fail_close: false,
            }
        }

        fn log(&self, what: &str) {
            self.journal
                .lock()
                .unwrap()
                .push(format!("{what}:{}", self.id));
        }
    }

    impl Element for Recorder {
        fn name(&self) -> &'static str {
            "recorder"
        }

        fn request(&self, ctx: &Context, conn: Connection, next: Next<'_>) -> Result<Connection> {
            let mut conn = next.request(ctx, conn)?;
            if self.fail_request {
                let cause = KernelmeshError::Configuration {
                    target: format!("stage-{}", self.id),
                    message: "refused".into(),
                };
                return Err(rollback("recorder", ctx, &mut conn, next, cause, |_| {
                    self.log("undo");
                    Ok(())
                }));
            }
            self.log("apply");
            Ok(conn)
        }

        fn close(&self, ctx: &Context, conn: &mut Connection, next: Next<'_>) -> Result<()> {
            self.log("close");
            let local = if self.fail_close {
                Err(KernelmeshError::Configuration {
                    target: format!("stage-{}", self.id),
                    message: "close refused".into(),
                })
            } else {
                Ok(())
            };
            finish_close(local, next.close(ctx, conn))
        }
    }

    fn conn() -> Connection {
        Connection::new(kernelmesh_common::types::Mechanism::kernel(
            "nsm-1",
            "file:///var/run/netns/pod",
        ))
    }

    fn journal() -> Arc<Mutex<Vec<String>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    fn entries(journal: &Arc<Mutex<Vec<String>>>) -> Vec<String> {
        journal.lock().unwrap().clone()
    }

    #[test]
    fn effects_apply_innermost_first() {
        let j = journal();
        let chain = Chain::new(
            (1..=3)
                .map(|i| Arc::new(Recorder::new(i, &j)) as Arc<dyn Element>)
                .collect(),
        );

        let _ = chain.apply(&Context::new(), conn()).expect("request");

        assert_eq!(entries(&j), vec!["apply:3", "apply:2", "apply:1"]);
    }

    #[test]
    fn failing_stage_closes_applied_stages_once_in_reverse_order() {
        // Chain of five; stage 2 fails after stages 5, 4, 3 applied.
        let j = journal();
        let stages: Vec<Arc<dyn Element>> = (1..=5)
            .map(|i| {
                let mut r = Recorder::new(i, &j);
                r.fail_request = i == 2;
                Arc::new(r) as Arc<dyn Element>
            })
            .collect();
        let chain = Chain::new(stages);

        let err = chain.apply(&Context::new(), conn()).unwrap_err();

        assert!(err.to_string().contains("stage-2"), "got: {err}");
        assert_eq!(
            entries(&j),
            vec![
                "apply:5", "apply:4", "apply:3", "undo:2", "close:3", "close:4", "close:5"
            ]
        );
    }

    #[test]
    fn rollback_keeps_cause_and_appends_close_errors() {
        let j = journal();
        let mut failing = Recorder::new(1, &j);
        failing.fail_request = true;
        let mut broken_close = Recorder::new(2, &j);
        broken_close.fail_close = true;
        let chain = Chain::new(vec![Arc::new(failing), Arc::new(broken_close)]);

        let err = chain.apply(&Context::new(), conn()).unwrap_err();

        match &err {
            KernelmeshError::Rollback { cause, close } => {
                assert!(cause.to_string().contains("stage-1"));
                assert!(close.contains("stage-2"));
            }
            other => unreachable!("unexpected error: {other}"),
        }
        assert!(err.to_string().starts_with("failed to configure stage-1"));
    }

    #[test]
    fn close_reaches_every_stage_despite_local_failure() {
        let j = journal();
        let mut first = Recorder::new(1, &j);
        first.fail_close = true;
        let chain = Chain::new(vec![
            Arc::new(first),
            Arc::new(Recorder::new(2, &j)),
            Arc::new(Recorder::new(3, &j)),
        ]);

        let err = chain.teardown(&Context::new(), &mut conn()).unwrap_err();

        assert!(err.to_string().contains("stage-1"));
        assert_eq!(entries(&j), vec!["close:1", "close:2", "close:3"]);
    }

    #[test]
    fn both_local_and_downstream_close_errors_are_kept() {
        let j = journal();
        let mut a = Recorder::new(1, &j);
        a.fail_close = true;
        let mut b = Recorder::new(2, &j);
        b.fail_close = true;
        let chain = Chain::new(vec![Arc::new(a), Arc::new(b)]);

        let err = chain.teardown(&Context::new(), &mut conn()).unwrap_err();
        let text = err.to_string();

        assert!(text.contains("stage-1") && text.contains("stage-2"), "got: {text}");
    }

    #[test]
    fn nested_chain_behaves_like_flat_chain() {
        let j = journal();
        let inner = Chain::new(vec![
            Arc::new(Recorder::new(2, &j)),
            Arc::new(Recorder::new(3, &j)),
        ]);
        let mut failing = Recorder::new(1, &j);
        failing.fail_request = true;
        let outer = Chain::new(vec![
            Arc::new(failing),
            Arc::new(inner),
            Arc::new(Recorder::new(4, &j)),
        ]);

        let _ = outer.apply(&Context::new(), conn()).unwrap_err();

        assert_eq!(
            entries(&j),
            vec!["apply:4", "apply:3", "apply:2", "undo:1", "close:2", "close:3", "close:4"]
        );
    }

    #[test]
    fn empty_chain_returns_connection_unchanged() {
        let chain = Chain::default();
        let c = conn();
        let out = chain.apply(&Context::new(), c.clone()).expect("request");
        assert_eq!(out, c);
        assert!(chain.is_empty());
        chain.teardown(&Context::new(), &mut c.clone()).expect("close");
    }
}
