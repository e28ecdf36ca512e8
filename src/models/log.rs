use serde::Serialize;

use crate::models::descriptor::PluginKind;

/// A single line of tap or target output.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LogLine {
    /// The kind of process which produced this line.
    pub source: PluginKind,
    /// The position of this line within its session, starting at 0.
    pub sequence: u64,
    /// Publication time as milliseconds since the unix epoch.
    pub timestamp: i64,
    pub text: String,
}
