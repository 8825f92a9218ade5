// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::time::Duration;

use canonical_error::{CanonicalError, failed_precondition_error,
                      unavailable_error};
use log::{debug, info, warn};
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};

// Source of "a new image file exists" notifications.
pub trait ImageEventSource {
    // Waits up to `timeout` for the next new image. Returns Ok(None) if none
    // arrived in time. An error means no further events will arrive.
    fn next_image(&mut self, timeout: Duration)
                  -> Result<Option<PathBuf>, CanonicalError>;
}

// Watches a folder tree for newly created (or moved in) files with a given
// extension.
pub struct FolderWatcher {
    // Must stay alive for events to be delivered.
    _watcher: RecommendedWatcher,
    events: Receiver<notify::Result<Event>>,
    extension: String,
    // Matching paths of an event carrying more than one.
    pending: VecDeque<PathBuf>,
}

impl FolderWatcher {
    pub fn new(folder: &Path, extension: &str)
               -> Result<Self, CanonicalError> {
        let (tx, rx) = mpsc::channel();
        let mut watcher = match notify::recommended_watcher(tx) {
            Ok(w) => w,
            Err(e) => {
                return Err(failed_precondition_error(
                    format!("Could not create watcher: {:?}", e).as_str()));
            }
        };
        if let Err(e) = watcher.watch(folder, RecursiveMode::Recursive) {
            return Err(failed_precondition_error(
                format!("Could not watch {:?}: {:?}", folder, e).as_str()));
        }
        info!("Watching {:?} for *.{} files", folder, extension);
        Ok(FolderWatcher{
            _watcher: watcher,
            events: rx,
            extension: extension.to_string(),
            pending: VecDeque::new(),
        })
    }

    fn has_extension(&self, path: &Path) -> bool {
        path.extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case(self.extension.as_str()))
    }

    fn is_arrival(kind: &EventKind) -> bool {
        matches!(kind,
                 EventKind::Create(_) |
                 EventKind::Modify(ModifyKind::Name(RenameMode::To)))
    }

    fn enqueue(&mut self, event: Event) {
        // A rename also produces a RenameMode::Both event; the RenameMode::To
        // event alone is enough to see the arrival.
        if !Self::is_arrival(&event.kind) {
            return;
        }
        let matching: Vec<PathBuf> = event.paths.into_iter()
            .filter(|p| self.has_extension(p)).collect();
        self.pending.extend(matching);
    }
}

impl ImageEventSource for FolderWatcher {
    fn next_image(&mut self, timeout: Duration)
                  -> Result<Option<PathBuf>, CanonicalError> {
        if let Some(path) = self.pending.pop_front() {
            return Ok(Some(path));
        }
        match self.events.recv_timeout(timeout) {
            Ok(Ok(event)) => {
                debug!("Watch event: {:?}", event);
                self.enqueue(event);
                Ok(self.pending.pop_front())
            },
            Ok(Err(e)) => {
                warn!("Watch error: {:?}", e);
                Ok(None)
            },
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                Err(unavailable_error("Folder watcher stopped"))
            },
        }
    }
}
