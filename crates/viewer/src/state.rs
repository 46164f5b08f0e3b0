use tracing::trace;

use crate::orchestrator::ViewerRequest;

/// Stages of one `render_viewer` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RenderState {
    Idle,
    KeyBuilt,
    CacheChecked,
    CachedEngine,
    Allocating,
    Rendering,
    Presenting,
    Cached,
    Done,
    Aborted,
}

#[derive(Debug)]
pub(crate) struct StateTrace {
    request: ViewerRequest,
    states: Vec<RenderState>,
}

impl StateTrace {
    pub(crate) fn new(request: ViewerRequest) -> Self {
        Self {
            request,
            states: Vec::with_capacity(8),
        }
    }

    pub(crate) fn enter(&mut self, state: RenderState) {
        if let Some(previous) = self.states.last() {
            assert_ne!(
                *previous,
                RenderState::Aborted,
                "no transition may follow an aborted request"
            );
        }
        trace!(
            time = self.request.time,
            view = self.request.view,
            ?state,
            "[viewer] render state"
        );
        self.states.push(state);
    }

    pub(crate) fn into_states(self) -> Vec<RenderState> {
        self.states
    }
}
