//! Typed functional map surfaces: evaluate caller-supplied functions
//! against single entries through the node's write pipeline, with the
//! type-erased result downcast back to the caller's type.

use std::sync::Arc;

use crate::grid::command::{
    Command, CommandResult, FnOut, ReadEntryView, ReadWriteEntryView,
    WriteEntryView, WriteOp,
};
use crate::grid::encoding::GridValue;
use crate::grid::node::GridNode;
use crate::utils::GridError;

use futures::future;

fn downcast<R: 'static>(out: FnOut) -> Result<R, GridError> {
    out.downcast::<R>()
        .map(|b| *b)
        .map_err(|_| GridError::msg("functional result had unexpected type"))
}

fn out_of<R: 'static>(result: CommandResult) -> Result<R, GridError> {
    match result {
        CommandResult::Out(out) => downcast(out),
        r => Err(GridError::Msg(format!(
            "functional evaluation produced {:?}",
            r
        ))),
    }
}

/// Read-only functional view of the grid.
pub struct ReadOnlyMap {
    node: Arc<GridNode>,
}

impl ReadOnlyMap {
    pub fn new(node: Arc<GridNode>) -> Self {
        ReadOnlyMap { node }
    }

    async fn eval_storage<R: Send + 'static>(
        &self,
        key: GridValue,
        f: Arc<dyn Fn(ReadEntryView<'_>) -> R + Send + Sync + 'static>,
    ) -> Result<R, GridError> {
        let cmd = Command::new(
            WriteOp::ReadOnly {
                key,
                f: Arc::new(move |view| Box::new(f(view)) as FnOut),
            },
            0,
            self.node.id,
        );
        out_of(self.node.invoke(cmd).await?)
    }

    /// Evaluate `f` against the entry of `key`.
    pub async fn eval<R: Send + 'static>(
        &self,
        key: &GridValue,
        f: impl Fn(ReadEntryView<'_>) -> R + Send + Sync + 'static,
    ) -> Result<R, GridError> {
        let key = self.node.codec().key_to_storage(key)?;
        self.eval_storage(key, Arc::new(f)).await
    }

    /// Evaluate `f` against each given key; results come back in key
    /// order.
    pub async fn eval_many<R: Send + 'static>(
        &self,
        keys: &[GridValue],
        f: impl Fn(ReadEntryView<'_>) -> R + Send + Sync + 'static,
    ) -> Result<Vec<R>, GridError> {
        let f: Arc<
            dyn Fn(ReadEntryView<'_>) -> R + Send + Sync + 'static,
        > = Arc::new(f);
        let mut evals = Vec::new();
        for key in keys {
            let key = self.node.codec().key_to_storage(key)?;
            evals.push(self.eval_storage(key, f.clone()));
        }
        future::join_all(evals).await.into_iter().collect()
    }

    /// Evaluate `f` against every locally stored key (snapshot; entries
    /// appearing afterwards are not visited).
    pub async fn eval_all<R: Send + 'static>(
        &self,
        f: impl Fn(ReadEntryView<'_>) -> R + Send + Sync + 'static,
    ) -> Result<Vec<R>, GridError> {
        let keys = self.node.stored_keys();
        let f: Arc<
            dyn Fn(ReadEntryView<'_>) -> R + Send + Sync + 'static,
        > = Arc::new(f);
        let mut evals = Vec::new();
        for key in keys {
            evals.push(self.eval_storage(key, f.clone()));
        }
        future::join_all(evals).await.into_iter().collect()
    }
}

/// Write-only functional view of the grid.
pub struct WriteOnlyMap {
    node: Arc<GridNode>,
}

impl WriteOnlyMap {
    pub fn new(node: Arc<GridNode>) -> Self {
        WriteOnlyMap { node }
    }

    async fn eval_storage(
        &self,
        key: GridValue,
        f: Arc<dyn Fn(&mut WriteEntryView<'_>) + Send + Sync + 'static>,
    ) -> Result<(), GridError> {
        let cmd =
            Command::new(WriteOp::WriteOnly { key, f }, 0, self.node.id);
        match self.node.invoke(cmd).await? {
            CommandResult::Done | CommandResult::None => Ok(()),
            r => Err(GridError::Msg(format!(
                "write-only evaluation produced {:?}",
                r
            ))),
        }
    }

    /// Run the consumer `f` against the entry of `key`.
    pub async fn eval(
        &self,
        key: &GridValue,
        f: impl Fn(&mut WriteEntryView<'_>) + Send + Sync + 'static,
    ) -> Result<(), GridError> {
        let key = self.node.codec().key_to_storage(key)?;
        self.eval_storage(key, Arc::new(f)).await
    }

    /// Run the consumer `f` against each given key independently; there
    /// is no cross-key atomicity.
    pub async fn eval_many(
        &self,
        keys: &[GridValue],
        f: impl Fn(&mut WriteEntryView<'_>) + Send + Sync + 'static,
    ) -> Result<(), GridError> {
        let f: Arc<
            dyn Fn(&mut WriteEntryView<'_>) + Send + Sync + 'static,
        > = Arc::new(f);
        let mut evals = Vec::new();
        for key in keys {
            let key = self.node.codec().key_to_storage(key)?;
            evals.push(self.eval_storage(key, f.clone()));
        }
        future::join_all(evals)
            .await
            .into_iter()
            .collect::<Result<Vec<()>, GridError>>()?;
        Ok(())
    }

    /// Run the consumer `f` against every locally stored key (snapshot).
    pub async fn eval_all(
        &self,
        f: impl Fn(&mut WriteEntryView<'_>) + Send + Sync + 'static,
    ) -> Result<(), GridError> {
        let keys = self.node.stored_keys();
        self.eval_many(&keys, f).await
    }
}

/// Read-write functional view of the grid; the workhorse behind derived
/// primitives such as clustered locks.
#[derive(Clone)]
pub struct ReadWriteMap {
    node: Arc<GridNode>,
}

impl ReadWriteMap {
    pub fn new(node: Arc<GridNode>) -> Self {
        ReadWriteMap { node }
    }

    pub fn node(&self) -> &Arc<GridNode> {
        &self.node
    }

    async fn eval_storage<R: Send + 'static>(
        &self,
        key: GridValue,
        f: Arc<
            dyn Fn(&mut ReadWriteEntryView<'_>) -> R + Send + Sync + 'static,
        >,
    ) -> Result<R, GridError> {
        let cmd = Command::new(
            WriteOp::ReadWrite {
                key,
                f: Arc::new(move |view| Box::new(f(view)) as FnOut),
            },
            0,
            self.node.id,
        );
        out_of(self.node.invoke(cmd).await?)
    }

    /// Evaluate `f` against the entry of `key`, observing and optionally
    /// mutating it.
    pub async fn eval<R: Send + 'static>(
        &self,
        key: &GridValue,
        f: impl Fn(&mut ReadWriteEntryView<'_>) -> R + Send + Sync + 'static,
    ) -> Result<R, GridError> {
        let key = self.node.codec().key_to_storage(key)?;
        self.eval_storage(key, Arc::new(f)).await
    }

    /// Evaluate `f` with an extra value argument, encoded to storage form
    /// before the function sees it.
    pub async fn eval_with_value<R: Send + 'static>(
        &self,
        key: &GridValue,
        value: &GridValue,
        f: impl Fn(&GridValue, &mut ReadWriteEntryView<'_>) -> R
            + Send
            + Sync
            + 'static,
    ) -> Result<R, GridError> {
        let key = self.node.codec().key_to_storage(key)?;
        let value = self.node.codec().value_to_storage(value)?;
        self.eval_storage(
            key,
            Arc::new(move |view: &mut ReadWriteEntryView<'_>| {
                f(&value, view)
            }),
        )
        .await
    }

    /// Evaluate `f` against each given key; results come back in key
    /// order.
    pub async fn eval_many<R: Send + 'static>(
        &self,
        keys: &[GridValue],
        f: impl Fn(&mut ReadWriteEntryView<'_>) -> R + Send + Sync + 'static,
    ) -> Result<Vec<R>, GridError> {
        let f: Arc<
            dyn Fn(&mut ReadWriteEntryView<'_>) -> R + Send + Sync + 'static,
        > = Arc::new(f);
        let mut evals = Vec::new();
        for key in keys {
            let key = self.node.codec().key_to_storage(key)?;
            evals.push(self.eval_storage(key, f.clone()));
        }
        future::join_all(evals).await.into_iter().collect()
    }

    /// Evaluate `f` against every locally stored key (snapshot; entries
    /// appearing afterwards are not visited).
    pub async fn eval_all<R: Send + 'static>(
        &self,
        f: impl Fn(&mut ReadWriteEntryView<'_>) -> R + Send + Sync + 'static,
    ) -> Result<Vec<R>, GridError> {
        let keys = self.node.stored_keys();
        let f: Arc<
            dyn Fn(&mut ReadWriteEntryView<'_>) -> R + Send + Sync + 'static,
        > = Arc::new(f);
        let mut evals = Vec::new();
        for key in keys {
            evals.push(self.eval_storage(key, f.clone()));
        }
        future::join_all(evals).await.into_iter().collect()
    }
}
