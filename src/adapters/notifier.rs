//! Surface Notifier Adapters
//!
//! Implements the `SurfaceNotifier` port with various backends.

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::domain::ports::{Surface, SurfaceNotifier};

/// Logging-based notifier.
///
/// Records reload requests in the tracing output. Used by the CLI, where no
/// widget host is running.
#[derive(Debug, Clone, Default)]
pub struct LoggingNotifier {
    /// Whether to log at info level (true) or debug level (false)
    info_level: bool,
}

impl LoggingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a notifier that logs at info level.
    pub fn info_level() -> Self {
        Self { info_level: true }
    }
}

impl SurfaceNotifier for LoggingNotifier {
    fn request_reload(&self, surface: Surface) {
        if self.info_level {
            info!(surface = %surface, "Surface reload requested");
        } else {
            debug!(surface = %surface, "Surface reload requested");
        }
    }
}

/// In-memory notifier for testing.
///
/// Collects reload requests for later inspection.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    requests: RwLock<Vec<Surface>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every request received so far, in order
    pub fn requests(&self) -> Vec<Surface> {
        self.requests.read().clone()
    }

    pub fn len(&self) -> usize {
        self.requests.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.read().is_empty()
    }

    /// Requests for one surface
    pub fn count_for(&self, surface: Surface) -> usize {
        self.requests.read().iter().filter(|s| **s == surface).count()
    }
}

impl SurfaceNotifier for RecordingNotifier {
    fn request_reload(&self, surface: Surface) {
        self.requests.write().push(surface);
    }
}

/// Fans a reload request out to several notifiers.
#[derive(Default)]
pub struct CompositeNotifier {
    notifiers: Vec<Box<dyn SurfaceNotifier>>,
}

impl CompositeNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_notifier<N: SurfaceNotifier + 'static>(mut self, notifier: N) -> Self {
        self.notifiers.push(Box::new(notifier));
        self
    }
}

impl std::fmt::Debug for CompositeNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeNotifier")
            .field("notifier_count", &self.notifiers.len())
            .finish()
    }
}

impl SurfaceNotifier for CompositeNotifier {
    fn request_reload(&self, surface: Surface) {
        for notifier in &self.notifiers {
            notifier.request_reload(surface);
        }
    }
}

impl<N: SurfaceNotifier + ?Sized> SurfaceNotifier for std::sync::Arc<N> {
    fn request_reload(&self, surface: Surface) {
        (**self).request_reload(surface)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_logging_notifier() {
        // Should not panic
        LoggingNotifier::new().request_reload(Surface::HomeWidget);
        LoggingNotifier::info_level().request_reload(Surface::LockScreen);
    }

    #[test]
    fn test_recording_notifier() {
        let notifier = RecordingNotifier::new();
        assert!(notifier.is_empty());

        notifier.request_reload(Surface::HomeWidget);
        notifier.request_reload(Surface::LockScreen);
        notifier.request_reload(Surface::HomeWidget);

        assert_eq!(notifier.len(), 3);
        assert_eq!(notifier.count_for(Surface::HomeWidget), 2);
    }

    #[test]
    fn test_composite_notifier() {
        let first = Arc::new(RecordingNotifier::new());
        let second = Arc::new(RecordingNotifier::new());

        let composite = CompositeNotifier::new()
            .with_notifier(Arc::clone(&first))
            .with_notifier(Arc::clone(&second))
            .with_notifier(LoggingNotifier::new());

        composite.request_reload(Surface::LockScreen);

        assert_eq!(first.requests(), vec![Surface::LockScreen]);
        assert_eq!(second.len(), 1);
        assert!(format!("{:?}", composite).contains("notifier_count: 3"));
    }
}
