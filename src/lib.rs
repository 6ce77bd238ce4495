//! Client for a handwriting-note archive whose page photos are recognized
//! asynchronously on the server.
//!
//! [`reconciler::PollingReconciler`] keeps an open note in step with the
//! server until every image is recognized; [`library::NoteLibrary`] and
//! [`detail::NoteDetail`] build the dashboard and detail views on top of it.

pub mod api;
pub mod clock;
pub mod config;
pub mod detail;
pub mod error;
pub mod library;
pub mod note;
pub mod notes_cache;
pub mod reconciler;
pub mod session;
pub mod snapshot;
