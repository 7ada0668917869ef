use bytes::Bytes;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;

use crate::handle::{FileInfo, Handle, ObjectType};

/// Reader handed out by [`Backend::load`].
pub type ObjectReader = Box<dyn AsyncRead + Send + Unpin>;

/// Callback invoked once per object by [`Backend::list`].
pub type ListFn<'a> = dyn FnMut(FileInfo) -> anyhow::Result<()> + Send + 'a;

/// The object-store contract a backup tool programs against.
///
/// Every call takes the caller's cancellation token. Implementations must
/// be safe to call concurrently from many tasks.
#[async_trait::async_trait]
pub trait Backend: Send + Sync {
    /// Human-readable description of where the repository lives.
    fn location(&self) -> String;

    /// Whether `err` means "the object does not exist".
    fn is_not_exist(&self, err: &anyhow::Error) -> bool;

    /// Whether the object behind `h` exists.
    async fn test(&self, cancel: &CancellationToken, h: &Handle) -> anyhow::Result<bool>;

    /// Store `data` under `h`. Returns once the write is accepted for persistence.
    async fn save(&self, cancel: &CancellationToken, h: &Handle, data: Bytes) -> anyhow::Result<()>;

    /// Read `length` bytes of `h` starting at `offset`. A `length` of 0 reads to the end.
    async fn load(
        &self,
        cancel: &CancellationToken,
        h: &Handle,
        length: usize,
        offset: u64,
    ) -> anyhow::Result<ObjectReader>;

    async fn stat(&self, cancel: &CancellationToken, h: &Handle) -> anyhow::Result<FileInfo>;

    /// Remove the object behind `h`. Removing a missing object succeeds.
    async fn remove(&self, cancel: &CancellationToken, h: &Handle) -> anyhow::Result<()>;

    /// Call `f` for every object of type `t`.
    async fn list(
        &self,
        cancel: &CancellationToken,
        t: ObjectType,
        f: &mut ListFn<'_>,
    ) -> anyhow::Result<()>;

    /// Remove the whole repository.
    async fn delete(&self, cancel: &CancellationToken) -> anyhow::Result<()>;

    /// Release local resources.
    async fn close(&self) -> anyhow::Result<()>;
}
