//! HTTP endpoint paths shared by the server and HTTP transports.

/// `GET`: authoritative document, sequence and trailing events.
pub const FULL_DATA_PATH: &str = "/api/canvas/sync/full_data";

/// `POST`: push a list of events.
pub const EVENT_PATH: &str = "/api/canvas/sync/event";

/// `POST`: upload a complete document.
pub const FULL_UPLOAD_PATH: &str = "/api/canvas/sync/full";

/// `GET`: server-sent event stream; takes a `clientId` query parameter.
pub const STREAM_PATH: &str = "/api/canvas/sync/sse";

/// `GET`: debug status.
pub const DEBUG_PATH: &str = "/api/canvas/sync/debug";

/// `POST`: drop the log and the stored document.
pub const RESET_PATH: &str = "/api/canvas/sync/reset";

/// `POST`: broadcast a `server:add_image` event.
pub const INJECT_IMAGE_PATH: &str = "/api/canvas/sync/inject_image";
