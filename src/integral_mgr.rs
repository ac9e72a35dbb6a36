//! Interning of integrals and row persistence.
//!
//! The manager assigns each distinct [`Integral`] a dense [`Component`] id
//! and implements [`RowSource`] over per-prototype store files: rows for
//! prototype `p` live in `PR<p>.dat`, keyed by the integral's binary form,
//! with a [`Metadata`] header in front of the expression record. A sidecar
//! `idPR<p>.dat` maps each saved integral to the dense id it carried in the
//! producing run.

use crate::expression::{Expression, Metadata};
use crate::graph::{Reflist, RowSource};
use crate::integral::{Component, Integral, Prototype};
use crate::store::{FileStore, Store, StoreMode};
use anyhow::{Context, Result, bail};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

pub struct IntegralMgr {
    dir: PathBuf,
    inner: Mutex<MgrInner>,
}

struct MgrInner {
    integrals: Vec<Integral>,
    stores: HashMap<Prototype, Arc<FileStore>>,
    id_stores: HashMap<Prototype, Arc<FileStore>>,
}

impl IntegralMgr {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            inner: Mutex::new(MgrInner {
                integrals: Vec::new(),
                stores: HashMap::new(),
                id_stores: HashMap::new(),
            }),
        }
    }

    /// Intern `integral`, returning its dense component id.
    pub fn manage(&self, integral: Integral) -> Component {
        let mut inner = self.inner.lock().expect("manager lock");

        // TODO: replace the linear scan with a hash index once runs carry
        // more than a few thousand distinct integrals.
        for (at, known) in inner.integrals.iter().enumerate() {
            if *known == integral {
                return at as Component;
            }
        }

        inner.integrals.push(integral);
        (inner.integrals.len() - 1) as Component
    }

    #[must_use]
    pub fn integral(&self, component: Component) -> Option<Integral> {
        self.inner
            .lock()
            .expect("manager lock")
            .integrals
            .get(component as usize)
            .cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().expect("manager lock").integrals.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn row_store(&self, prototype: Prototype, create: bool) -> Result<Option<Arc<FileStore>>> {
        let mut inner = self.inner.lock().expect("manager lock");
        if let Some(store) = inner.stores.get(&prototype) {
            return Ok(Some(store.clone()));
        }

        let path = self.dir.join(format!("PR{prototype}.dat"));
        let store = if path.exists() {
            Arc::new(FileStore::open(&path, StoreMode::Write)?)
        } else if create {
            Arc::new(FileStore::open(&path, StoreMode::Create)?)
        } else {
            return Ok(None);
        };

        inner.stores.insert(prototype, store.clone());
        Ok(Some(store))
    }

    fn id_store(&self, prototype: Prototype) -> Result<Arc<FileStore>> {
        let mut inner = self.inner.lock().expect("manager lock");
        if let Some(store) = inner.id_stores.get(&prototype) {
            return Ok(store.clone());
        }

        let path = self.dir.join(format!("idPR{prototype}.dat"));
        let store = Arc::new(FileStore::open(&path, StoreMode::Create)?);
        inner.id_stores.insert(prototype, store.clone());
        Ok(store)
    }

    /// Flush every open store file.
    pub fn flush(&self) -> Result<()> {
        let stores: Vec<Arc<FileStore>> = {
            let inner = self.inner.lock().expect("manager lock");
            inner
                .stores
                .values()
                .chain(inner.id_stores.values())
                .cloned()
                .collect()
        };
        for store in stores {
            store.flush()?;
        }
        Ok(())
    }
}

impl RowSource for IntegralMgr {
    fn load(&self, component: Component) -> Result<Option<(Reflist, Metadata)>> {
        let Some(integral) = self.integral(component) else {
            return Ok(None);
        };
        let Some(store) = self.row_store(integral.prototype(), false)? else {
            return Ok(None);
        };
        let Some(value) = store.get(&integral.to_binary())? else {
            return Ok(None);
        };

        if value.len() < Metadata::WIRE_LEN {
            bail!("row record for {integral} is truncated");
        }
        let meta = Metadata::from_binary(&value)?;
        let expression = Expression::from_binary(&value[Metadata::WIRE_LEN..])
            .with_context(|| format!("corrupt row record for {integral}"))?;
        if expression.is_empty() {
            // A row without terms carries no equation: a master.
            return Ok(None);
        }

        let mut row = Reflist::new();
        for term in expression.terms() {
            let head = self.manage(term.integral.clone());
            row.push(head, term.coefficient.clone());
        }
        Ok(Some((row, meta)))
    }

    fn save(&self, component: Component, row: &Reflist, meta: Metadata) -> Result<()> {
        let integral = self
            .integral(component)
            .with_context(|| format!("saving unknown component {component}"))?;

        let mut expression = Expression::with_capacity(row.len());
        for term in &row.terms {
            let head = self
                .integral(term.head)
                .with_context(|| format!("row head {} is not managed", term.head))?;
            expression.push(head, term.coefficient.clone());
        }

        let mut value = meta.to_binary().to_vec();
        value.extend_from_slice(&expression.to_binary());

        let store = self
            .row_store(integral.prototype(), true)?
            .expect("store opened with create");
        store.set(&integral.to_binary(), &value)?;

        let id_store = self.id_store(integral.prototype())?;
        id_store.set(&integral.to_binary(), &component.to_le_bytes())?;

        Ok(())
    }
}
