/// Lifecycle of a single feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FeedState {
    /// Not running. Initial state, and the state after deactivation.
    ///
    /// A dormant feed holds no peers and dispatches nothing. Its progress
    /// counters keep their last values so the report can still show them.
    #[default]
    Dormant,

    /// Working through its active range.
    ///
    /// Batches are dispatched to peers, validated and persisted in order.
    Active,

    /// Active range exhausted.
    ///
    /// Terminal until the feed is activated again with a new target.
    Finished,
}

impl FeedState {
    /// Check if a transition to the target state is valid.
    ///
    /// Reactivation of a finished feed goes through `Active` directly;
    /// deactivation is allowed from any state.
    pub fn can_transition_to(&self, target: FeedState) -> bool {
        match self {
            FeedState::Dormant => matches!(target, FeedState::Active | FeedState::Dormant),
            FeedState::Active => matches!(
                target,
                FeedState::Active | FeedState::Finished | FeedState::Dormant
            ),
            FeedState::Finished => matches!(target, FeedState::Active | FeedState::Dormant),
        }
    }

    pub fn is_active(&self) -> bool {
        *self == FeedState::Active
    }
}
