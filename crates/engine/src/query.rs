//! Read-only views of the repository.

use crate::Engine;
use crate::error::{Error, ErrorKind, Result, state_error};
use arca_state::CurrentEntry;
use async_stream::stream;
use futures::{Stream, StreamExt};

impl Engine {
    /// Names of all versions, oldest first.
    pub async fn list_versions(&self) -> Result<Vec<String>> {
        self.verify().await?;
        self.states.list_versions().await.map_err(state_error)
    }

    /// Stream the entries current at `version` (`None` for the latest)
    /// whose relative name starts with `prefix`, in name order.
    ///
    /// A version that sorts between two snapshots shows the older one. An
    /// empty repository yields nothing unless a version was asked for, which
    /// is then [`ErrorKind::VersionNotFound`].
    pub fn query_entries<'a>(
        &'a self,
        prefix: Option<&'a str>,
        version: Option<&'a str>,
    ) -> impl Stream<Item = Result<CurrentEntry>> + 'a {
        stream! {
            let snapshot = match self.states.open_read_only(version).await {
                Ok(snapshot) => snapshot,
                Err(err) => {
                    yield Err(state_error(err));
                    return;
                },
            };
            let Some(snapshot) = snapshot else {
                if let Some(version) = version {
                    yield Err(Error::from(ErrorKind::VersionNotFound(version.to_string())));
                }
                return;
            };
            tracing::debug!(version = snapshot.version(), ?prefix, "Querying entries");
            {
                let mut entries = snapshot.repository().current_entries(prefix, None);
                while let Some(entry) = entries.next().await {
                    yield entry.map_err(state_error);
                }
            }
            snapshot.close().await;
        }
    }
}
