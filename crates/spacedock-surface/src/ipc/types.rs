use serde::{Deserialize, Serialize};

pub const PROTOCOL_VERSION: u32 = 1;

// =============================================================================
// Request contexts
// =============================================================================

/// Correlation context carried by every request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Ctx {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

/// Context for bundle-scoped requests. The target bundle is always explicit;
/// there is no "current bundle" fallback.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleCtx {
    #[serde(flatten)]
    pub ctx: Ctx,
    pub launcher_bundle_id: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WriteMode {
    /// Fail if the file already exists.
    Create,
    /// Create or overwrite.
    #[default]
    Set,
}

// =============================================================================
// Request - all IPC requests
// =============================================================================

/// IPC request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Request {
    // === Pre-activation surface ===
    /// Handshake; legal before any bundle is loaded.
    Init {
        #[serde(flatten)]
        ctx: Ctx,
    },

    /// Liveness probe.
    Ping {
        #[serde(flatten)]
        ctx: Ctx,
    },

    /// Default sync server URL configured for this daemon.
    GetServerUrl {
        #[serde(flatten)]
        ctx: Ctx,
    },

    /// Loaded bundles and their health.
    Status {
        #[serde(flatten)]
        ctx: Ctx,
    },

    /// Stop the daemon.
    Shutdown {
        #[serde(flatten)]
        ctx: Ctx,
    },

    /// Load a bundle from raw bytes.
    #[serde(rename_all = "camelCase")]
    LoadBundle {
        #[serde(flatten)]
        ctx: BundleCtx,
        bundle_bytes_hex: String,
        /// Explicit sync endpoint override; wins over the manifest.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        server_url: Option<String>,
        /// Previously obtained manifest, reused instead of re-parsing.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        manifest: Option<ManifestInfo>,
    },

    /// Unload a bundle and release its resources.
    UnloadBundle {
        #[serde(flatten)]
        ctx: BundleCtx,
    },

    /// Record the app slug served for a bundle; legal before activation.
    #[serde(rename_all = "camelCase")]
    SetAppSlug {
        #[serde(flatten)]
        ctx: BundleCtx,
        app_slug: String,
    },

    // === Bundle-scoped operations (require Active) ===
    GetManifest {
        #[serde(flatten)]
        ctx: BundleCtx,
    },

    ReadFile {
        #[serde(flatten)]
        ctx: BundleCtx,
        path: String,
    },

    #[serde(rename_all = "camelCase")]
    WriteFile {
        #[serde(flatten)]
        ctx: BundleCtx,
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bytes_hex: Option<String>,
        #[serde(default)]
        mode: WriteMode,
    },

    /// Write-if-different; reports whether anything changed.
    UpdateFile {
        #[serde(flatten)]
        ctx: BundleCtx,
        path: String,
        content: String,
    },

    /// JSON-pointer patch into a structured file.
    PatchFile {
        #[serde(flatten)]
        ctx: BundleCtx,
        path: String,
        pointer: Vec<String>,
        value: serde_json::Value,
    },

    DeleteFile {
        #[serde(flatten)]
        ctx: BundleCtx,
        path: String,
    },

    #[serde(rename_all = "camelCase")]
    Rename {
        #[serde(flatten)]
        ctx: BundleCtx,
        old_path: String,
        new_path: String,
    },

    Exists {
        #[serde(flatten)]
        ctx: BundleCtx,
        path: String,
    },

    ListDirectory {
        #[serde(flatten)]
        ctx: BundleCtx,
        path: String,
    },

    WatchFile {
        #[serde(flatten)]
        ctx: BundleCtx,
        path: String,
    },

    #[serde(rename_all = "camelCase")]
    UnwatchFile {
        #[serde(flatten)]
        ctx: BundleCtx,
        watch_id: String,
    },

    WatchDirectory {
        #[serde(flatten)]
        ctx: BundleCtx,
        path: String,
    },

    #[serde(rename_all = "camelCase")]
    UnwatchDirectory {
        #[serde(flatten)]
        ctx: BundleCtx,
        watch_id: String,
    },

    /// Serialize the bundle's current document state.
    ToBytes {
        #[serde(flatten)]
        ctx: BundleCtx,
    },

    /// Serialize a detached fork of the bundle's document state.
    ForkToBytes {
        #[serde(flatten)]
        ctx: BundleCtx,
    },

    // === Fetch interception ===
    /// Serve a URL from the bundle space, or report a bypass.
    Fetch {
        #[serde(flatten)]
        ctx: Ctx,
        url: String,
        /// Upgrade header, if any ("websocket" bypasses entirely).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        upgrade: Option<String>,
    },
}

/// Summary of a request for span fields and response shaping.
#[derive(Debug, Clone, Copy)]
pub struct RequestInfo<'a> {
    pub op: &'static str,
    pub id: Option<&'a str>,
    pub launcher_bundle_id: Option<&'a str>,
}

impl Request {
    pub fn info(&self) -> RequestInfo<'_> {
        use Request::*;
        let (op, ctx, bundle) = match self {
            Init { ctx } => ("init", ctx, None),
            Ping { ctx } => ("ping", ctx, None),
            GetServerUrl { ctx } => ("getServerUrl", ctx, None),
            Status { ctx } => ("status", ctx, None),
            Shutdown { ctx } => ("shutdown", ctx, None),
            Fetch { ctx, .. } => ("fetch", ctx, None),
            LoadBundle { ctx, .. } => ("loadBundle", &ctx.ctx, Some(&ctx.launcher_bundle_id)),
            UnloadBundle { ctx } => ("unloadBundle", &ctx.ctx, Some(&ctx.launcher_bundle_id)),
            SetAppSlug { ctx, .. } => ("setAppSlug", &ctx.ctx, Some(&ctx.launcher_bundle_id)),
            GetManifest { ctx } => ("getManifest", &ctx.ctx, Some(&ctx.launcher_bundle_id)),
            ReadFile { ctx, .. } => ("readFile", &ctx.ctx, Some(&ctx.launcher_bundle_id)),
            WriteFile { ctx, .. } => ("writeFile", &ctx.ctx, Some(&ctx.launcher_bundle_id)),
            UpdateFile { ctx, .. } => ("updateFile", &ctx.ctx, Some(&ctx.launcher_bundle_id)),
            PatchFile { ctx, .. } => ("patchFile", &ctx.ctx, Some(&ctx.launcher_bundle_id)),
            DeleteFile { ctx, .. } => ("deleteFile", &ctx.ctx, Some(&ctx.launcher_bundle_id)),
            Rename { ctx, .. } => ("rename", &ctx.ctx, Some(&ctx.launcher_bundle_id)),
            Exists { ctx, .. } => ("exists", &ctx.ctx, Some(&ctx.launcher_bundle_id)),
            ListDirectory { ctx, .. } => {
                ("listDirectory", &ctx.ctx, Some(&ctx.launcher_bundle_id))
            }
            WatchFile { ctx, .. } => ("watchFile", &ctx.ctx, Some(&ctx.launcher_bundle_id)),
            UnwatchFile { ctx, .. } => ("unwatchFile", &ctx.ctx, Some(&ctx.launcher_bundle_id)),
            WatchDirectory { ctx, .. } => {
                ("watchDirectory", &ctx.ctx, Some(&ctx.launcher_bundle_id))
            }
            UnwatchDirectory { ctx, .. } => {
                ("unwatchDirectory", &ctx.ctx, Some(&ctx.launcher_bundle_id))
            }
            ToBytes { ctx } => ("toBytes", &ctx.ctx, Some(&ctx.launcher_bundle_id)),
            ForkToBytes { ctx } => ("forkToBytes", &ctx.ctx, Some(&ctx.launcher_bundle_id)),
        };
        RequestInfo {
            op,
            id: ctx.id.as_deref(),
            launcher_bundle_id: bundle.map(String::as_str),
        }
    }
}

// =============================================================================
// Response
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NotInitialized,
    StoreError,
    ConnectionError,
    Timeout,
    BundleLoadFailed,
    InvalidRequest,
    MalformedPayload,
    FrameTooLarge,
    IoError,
    Disconnected,
    DaemonUnavailable,
    Internal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
    pub retryable: bool,
}

impl ErrorPayload {
    pub fn new(code: ErrorCode, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            code,
            message: message.into(),
            retryable,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestInfo {
    pub root_id: String,
    /// Entrypoint application slugs, first is the default.
    pub entrypoints: Vec<String>,
    /// Network URIs the sync endpoint may be derived from.
    #[serde(default)]
    pub sync_endpoints: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntryKindWire {
    File,
    Directory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirEntryInfo {
    pub name: String,
    pub kind: EntryKindWire,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchPayload {
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_hex: Option<String>,
    /// True when the request is outside this daemon's authority and should
    /// pass through unmodified.
    #[serde(default)]
    pub bypass: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleStatusInfo {
    pub launcher_bundle_id: String,
    pub state: String,
    pub connection_healthy: bool,
    pub reconnect_attempts: u32,
    pub watcher_count: usize,
}

/// Typed response payloads. Untagged on the wire: each variant carries at
/// least one required field, so the shape disambiguates. Plain
/// acknowledgements are a `success` response with no data at all.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponseData {
    Fetched(FetchPayload),
    #[serde(rename_all = "camelCase")]
    Initialized {
        protocol_version: u32,
        needs_reinit: bool,
        resumed_bundle: Option<String>,
    },
    Pong {
        version: String,
    },
    Status {
        bundles: Vec<BundleStatusInfo>,
    },
    Manifest {
        manifest: ManifestInfo,
    },
    Loaded {
        skipped: bool,
    },
    #[serde(rename_all = "camelCase")]
    File {
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bytes_hex: Option<String>,
    },
    Listing {
        entries: Vec<DirEntryInfo>,
    },
    #[serde(rename_all = "camelCase")]
    WatchStarted {
        watch_id: String,
    },
    #[serde(rename_all = "camelCase")]
    BundleBytes {
        bytes_hex: String,
    },
    #[serde(rename_all = "camelCase")]
    ServerUrl {
        server_url: Option<String>,
    },
    Changed {
        changed: bool,
    },
    Exists {
        exists: bool,
    },
}

/// IPC response; echoes the request type and correlation id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    #[serde(rename = "type")]
    pub op: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<ResponseData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
}

impl Response {
    pub fn ok(op: impl Into<String>, id: Option<String>, data: ResponseData) -> Self {
        Self {
            op: op.into(),
            id,
            success: true,
            data: Some(data),
            error: None,
        }
    }

    /// Success with no payload.
    pub fn ack(op: impl Into<String>, id: Option<String>) -> Self {
        Self {
            op: op.into(),
            id,
            success: true,
            data: None,
            error: None,
        }
    }

    pub fn err(op: impl Into<String>, id: Option<String>, error: ErrorPayload) -> Self {
        Self {
            op: op.into(),
            id,
            success: false,
            data: None,
            error: Some(error),
        }
    }
}

// =============================================================================
// Notifications - unsolicited, no correlation id
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChangeOriginWire {
    Local,
    Remote,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Notification {
    #[serde(rename_all = "camelCase")]
    FileChanged {
        launcher_bundle_id: String,
        watch_id: String,
        path: String,
        origin: ChangeOriginWire,
    },
    #[serde(rename_all = "camelCase")]
    DirectoryChanged {
        launcher_bundle_id: String,
        watch_id: String,
        path: String,
        origin: ChangeOriginWire,
    },
    #[serde(rename_all = "camelCase")]
    Disconnected { launcher_bundle_id: String },
    #[serde(rename_all = "camelCase")]
    Reconnecting {
        launcher_bundle_id: String,
        attempt: u32,
    },
    #[serde(rename_all = "camelCase")]
    Reconnected { launcher_bundle_id: String },
    #[serde(rename_all = "camelCase")]
    ReconnectionFailed {
        launcher_bundle_id: String,
        attempts: u32,
    },
    Ready {},
    #[serde(rename_all = "camelCase")]
    NeedsReinit {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

/// Anything the daemon writes to a client connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerMessage {
    Response(Response),
    Notification(Notification),
}
