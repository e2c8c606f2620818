use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// The graph has tasks waiting on dependencies but nothing runnable, so
    /// no progress is possible (typically a cycle).
    #[error("no runnable task in graph. waiting: {waiting}")]
    UnreachableTasks { waiting: usize },

    /// A worker reported the task as failed; the run is aborted.
    #[error("task {key} failed on worker: {error}")]
    TaskFailure { key: String, error: String },

    /// A required key has no known holder.
    #[error("no worker holds data for key {key}")]
    MissingData { key: String },

    #[error(transparent)]
    Graph(#[from] taskgrid_dag::GraphError),

    #[error(transparent)]
    Transport(#[from] taskgrid_net::NetError),

    #[error(transparent)]
    Codec(#[from] taskgrid_messages::codec::CodecError),

    /// The coordinator shut down while a routine was waiting on replies.
    #[error("scheduler shut down mid-run")]
    Shutdown,
}

pub type Result<T> = std::result::Result<T, Error>;
