//! Big/small display assignment

use crate::types::MediaStream;
use serde::Serialize;

/// Which stream goes in the primary and which in the thumbnail position.
///
/// Always derived through [`route`]; never edited in place.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct StreamRouting {
    pub big_stream: Option<MediaStream>,
    pub small_stream: Option<MediaStream>,
    pub has_remote_video: bool,
}

/// Assign local/remote streams to the big and small roles.
///
/// With `local_is_big` unset the remote stream is big. `has_remote_video` only
/// depends on the remote stream being present and active.
pub fn route(
    local: Option<&MediaStream>,
    remote: Option<&MediaStream>,
    local_is_big: bool,
) -> StreamRouting {
    let (big, small) = if local_is_big {
        (local, remote)
    } else {
        (remote, local)
    };

    StreamRouting {
        big_stream: big.cloned(),
        small_stream: small.cloned(),
        has_remote_video: remote.is_some_and(MediaStream::is_active),
    }
}
