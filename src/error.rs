use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("No routes exist for message type {message_type}"))]
    NoRoutes { message_type: String },

    #[snafu(display("No endpoint is registered for uri {uri}"))]
    UnknownEndpoint { uri: String },

    #[snafu(display("Routing for message type {message_type} is ambiguous: {reason}"))]
    IndeterminateRoutes {
        message_type: String,
        reason: String,
    },

    #[snafu(display("No handler is registered for message type {message_type}"))]
    NoHandler { message_type: String },

    #[snafu(display("No serializer is registered for content type {content_type}"))]
    UnknownSerializer { content_type: String },

    #[snafu(display("Serialization failure for message type {message_type}"))]
    Serialization {
        message_type: String,
        #[snafu(source)]
        source: serde_json::Error,
    },

    #[snafu(display("Sender for {uri} is latched and not accepting work"))]
    SenderLatched { uri: String },

    #[snafu(display("Send to {uri} timed out"))]
    SendTimeout { uri: String },

    #[snafu(display("Destination queue at {uri} does not exist"))]
    QueueMissing { uri: String },

    #[snafu(display("Transport failure sending to {uri}: {message}"))]
    Transport { uri: String, message: String },

    #[snafu(display("Malformed wire data: {message}"))]
    Wire { message: String },

    #[snafu(display("Error returned from database"))]
    Sqlx {
        #[snafu(source)]
        source: sqlx::Error,
    },

    #[snafu(display("The message bus is shutting down"))]
    ShuttingDown,

    #[snafu(display("Handler for {message_type} failed: {message}"))]
    HandlerFailure {
        message_type: String,
        message: String,
    },

    #[snafu(whatever, display("{message}"))]
    Whatever {
        message: String,
        #[snafu(source(from(eyre::Report, Some)))]
        source: Option<eyre::Report>,
    },
}

impl From<sqlx::Error> for Error {
    fn from(source: sqlx::Error) -> Self {
        Self::Sqlx { source }
    }
}

impl From<serde_json::Error> for Error {
    fn from(source: serde_json::Error) -> Self {
        Self::Serialization {
            message_type: String::new(),
            source,
        }
    }
}

impl Error {
    pub fn no_routes(message_type: impl Into<String>) -> Self {
        Self::NoRoutes {
            message_type: message_type.into(),
        }
    }

    pub fn unknown_endpoint(uri: impl Into<String>) -> Self {
        Self::UnknownEndpoint { uri: uri.into() }
    }

    pub fn transport(uri: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transport {
            uri: uri.into(),
            message: message.into(),
        }
    }

    pub fn wire(message: impl Into<String>) -> Self {
        Self::Wire {
            message: message.into(),
        }
    }

    /// True for errors that indicate a configuration problem rather than
    /// a transient fault. These are surfaced to the caller and never
    /// retried.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            Self::NoRoutes { .. }
                | Self::UnknownEndpoint { .. }
                | Self::IndeterminateRoutes { .. }
                | Self::NoHandler { .. }
                | Self::UnknownSerializer { .. }
        )
    }
}
