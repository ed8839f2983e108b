//! Ambient call context: which session and agent an LLM call belongs to.
//!
//! The tags live in task-locals so concurrent analyses never see each
//! other's values. Setting a tag is always scoped to a future.

use std::future::Future;

tokio::task_local! {
    static SESSION_ID: String;
    static AGENT_NAME: String;
}

/// Run `fut` with the given telemetry session id in scope.
pub async fn with_session<F: Future>(session_id: impl Into<String>, fut: F) -> F::Output {
    SESSION_ID.scope(session_id.into(), fut).await
}

/// Run `fut` attributing all gateway calls inside it to `agent`.
pub async fn with_agent<F: Future>(agent: impl Into<String>, fut: F) -> F::Output {
    AGENT_NAME.scope(agent.into(), fut).await
}

/// Current session id, or "unscoped" outside any [`with_session`].
pub fn current_session() -> String {
    SESSION_ID
        .try_with(|s| s.clone())
        .unwrap_or_else(|_| "unscoped".to_string())
}

/// Current agent name, or "unknown" outside any [`with_agent`].
pub fn current_agent() -> String {
    AGENT_NAME
        .try_with(|a| a.clone())
        .unwrap_or_else(|_| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tags_are_scoped_to_the_future() {
        assert_eq!(current_session(), "unscoped");
        assert_eq!(current_agent(), "unknown");

        with_session("sess-1", async {
            assert_eq!(current_session(), "sess-1");
            with_agent("collector", async {
                assert_eq!(current_agent(), "collector");
                assert_eq!(current_session(), "sess-1");
            })
            .await;
            assert_eq!(current_agent(), "unknown");
        })
        .await;

        assert_eq!(current_session(), "unscoped");
    }

    #[tokio::test]
    async fn sibling_tasks_do_not_leak_tags() {
        let a = tokio::spawn(with_session("sess-a", async {
            tokio::task::yield_now().await;
            current_session()
        }));
        let b = tokio::spawn(with_session("sess-b", async {
            tokio::task::yield_now().await;
            current_session()
        }));
        assert_eq!(a.await.unwrap(), "sess-a");
        assert_eq!(b.await.unwrap(), "sess-b");
    }
}
