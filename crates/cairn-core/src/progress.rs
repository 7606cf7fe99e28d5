/// One progress event emitted by the store, restore, and verify
/// pipelines, consumed by an external renderer.
#[derive(Debug, Default)]
pub struct Progress {
    pub current_path: String,
    pub current_item_bytes_total: u64,
    pub current_item_bytes_done: u64,
    pub cumulative_bytes_total: u64,
    pub cumulative_bytes_done: u64,
    pub error: Option<cairn_types::CairnError>,
}

impl Progress {
    pub fn for_path(path: impl Into<String>) -> Self {
        Self {
            current_path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_error(mut self, error: cairn_types::CairnError) -> Self {
        self.error = Some(error);
        self
    }
}

/// Callback invoked for every progress event. Pipelines call this from
/// worker threads; implementations must be cheap and non-blocking.
pub type ProgressFn<'a> = dyn Fn(Progress) + Send + Sync + 'a;

/// A renderer that discards all events.
pub fn sink() -> impl Fn(Progress) + Send + Sync {
    |_| {}
}
