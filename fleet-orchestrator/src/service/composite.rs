//! Composite driver
//!
//! Steps run strictly in order: a child is enqueued only once the previous one
//! is terminal. The registry cancels the remaining steps when one fails and
//! aggregates the parent, so the driver only has to skip what is already done.

use fleet_core::domain::job::{JobId, JobState};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::Inner;

pub(super) async fn drive(inner: Arc<Inner>, parent: JobId, children: Vec<JobId>) {
    if let Err(e) = inner.registry.transition(parent, JobState::Running, None) {
        debug!("Composite job {} not started: {}", parent, e);
        forget_all(&inner, parent, &children);
        return;
    }
    info!(
        "Starting composite job {} with {} steps",
        parent,
        children.len()
    );

    for (index, child) in children.iter().enumerate() {
        match inner.registry.state(*child) {
            Ok(state) if !state.is_terminal() => {}
            _ => continue,
        }

        debug!("Composite job {} dispatching step {} ({})", parent, index + 1, child);
        inner.enqueue(*child);

        let finished = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            view = inner.registry.wait_terminal(*child) => view,
        };
        match finished {
            Ok(view) if view.state != JobState::Completed => {
                info!(
                    "Composite job {} stopped at step {}: {}",
                    parent,
                    index + 1,
                    view.state
                );
            }
            Ok(_) => {}
            Err(e) => {
                warn!("Lost track of step {} of job {}: {}", index + 1, parent, e);
                break;
            }
        }
    }

    forget_all(&inner, parent, &children);
}

fn forget_all(inner: &Inner, parent: JobId, children: &[JobId]) {
    inner.forget(parent);
    for child in children {
        inner.forget(*child);
    }
}
