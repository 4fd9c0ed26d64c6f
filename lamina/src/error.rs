use thiserror::Error;

/// The recoverable ways a subscription attempt can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum SubscribeError {
	/// The subscriber already holds a link on this cell. Unsubscribe
	/// first to change how an existing subscription is dispatched.
	#[error("the subscriber is already subscribed to this cell")]
	AlreadySubscribed,
}

/// The recoverable ways an unsubscription attempt can fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum UnsubscribeError {
	/// No link between this cell and the subscriber exists.
	#[error("the subscriber is not subscribed to this cell")]
	NotSubscribed,
}
