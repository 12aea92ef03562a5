//! `config` service: user items of this server, merged with the ones of
//! every server registered as a proxy.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

use super::item::Mutability;
use super::store::ConfigStore;
use crate::client::RpcClient;
use crate::manager::{LifecycleHooks, ManagerContext};
use crate::server::dispatch::{MethodTable, ServiceHandler};
use crate::types::api::{ConfigItemView, ConfigSetItem, ConfigStatus, ConfigUpdate, Filter};
use crate::types::{Error, Result};

#[derive(Debug)]
pub struct ConfigManager {
    store: Arc<ConfigStore>,
    ctx: OnceLock<ManagerContext>,
    /// Serializes set/reset, local and fanned out.
    updates: tokio::sync::Mutex<()>,
}

impl ConfigManager {
    pub fn new(store: Arc<ConfigStore>) -> Self {
        Self {
            store,
            ctx: OnceLock::new(),
            updates: tokio::sync::Mutex::new(()),
        }
    }

    async fn proxied_servers(&self) -> Result<Vec<RpcClient>> {
        match self.ctx.get() {
            Some(ctx) => ctx.proxied_servers().await,
            None => Ok(Vec::new()),
        }
    }

    fn local_items(&self, names: &[String]) -> BTreeMap<String, ConfigItemView> {
        self.store
            .views(Mutability::User)
            .into_iter()
            .filter(|item| names.is_empty() || names.contains(&item.name))
            .map(|item| (item.name.clone(), item))
            .collect()
    }

    /// Local user items plus the ones of proxied servers. A name known on
    /// both sides with different values is a conflict when `check_conflicts`.
    async fn merged(&self, names: &[String], check_conflicts: bool) -> Result<BTreeMap<String, ConfigItemView>> {
        let mut items = self.local_items(names);
        let filter = Filter {
            names: names.to_vec(),
            ignore_unknown: true,
        };
        for server in self.proxied_servers().await? {
            let remote = server.config().get(&filter).await?.into_result()?;
            for item in remote.items {
                match items.get(&item.name) {
                    Some(known) if check_conflicts && known.value != item.value => {
                        return Err(Error::conflict(format!(
                            "conflicting values for config item {}: {:?} here, {:?} on {}",
                            item.name,
                            known.value,
                            item.value,
                            server.target()
                        )));
                    }
                    Some(_) => {}
                    None => {
                        items.insert(item.name.clone(), item);
                    }
                }
            }
        }
        Ok(items)
    }

    async fn get(&self, filter: Filter) -> Result<ConfigStatus> {
        let items = self.merged(&filter.names, true).await?;
        check_names(&items, &filter.names, filter.ignore_unknown, true)?;
        Ok(ConfigStatus {
            items: items.into_values().collect(),
        })
    }

    async fn set(&self, update: ConfigUpdate) -> Result<ConfigStatus> {
        let _guard = self.updates.lock().await;
        let names: Vec<String> = update.items.iter().map(|i| i.name.clone()).collect();
        let known = self.merged(&names, false).await?;
        check_names(&known, &names, update.ignore_unknown, false)?;

        let local_names = self.local_items(&names);
        let local: Vec<(String, String)> = update
            .items
            .iter()
            .filter(|i| local_names.contains_key(&i.name))
            .map(|i| (i.name.clone(), i.value.clone()))
            .collect();
        for (name, value) in &local {
            self.store.validate_user(name, value)?;
        }

        let remote = ConfigUpdate {
            items: update.items.clone(),
            ignore_unknown: true,
        };
        for server in self.proxied_servers().await? {
            server.config().set(&remote).await?.into_result()?;
        }
        if !local.is_empty() {
            self.store.set_many(&local)?;
        }
        tracing::info!("Config updated: {}", describe(&update.items));

        let items = self.merged(&names, true).await?;
        Ok(ConfigStatus {
            items: items.into_values().collect(),
        })
    }

    async fn reset(&self, filter: Filter) -> Result<ConfigStatus> {
        let _guard = self.updates.lock().await;
        let known = self.merged(&filter.names, false).await?;
        check_names(&known, &filter.names, filter.ignore_unknown, false)?;

        let remote = Filter {
            names: filter.names.clone(),
            ignore_unknown: true,
        };
        for server in self.proxied_servers().await? {
            server.config().reset(&remote).await?.into_result()?;
        }
        let local: Vec<String> = self.local_items(&filter.names).into_keys().collect();
        if !local.is_empty() {
            self.store.reset(&local)?;
        }
        tracing::info!("Config reset: {}", filter.names.join(", "));

        let items = self.merged(&filter.names, true).await?;
        Ok(ConfigStatus {
            items: items.into_values().collect(),
        })
    }
}

fn check_names(
    items: &BTreeMap<String, ConfigItemView>,
    names: &[String],
    ignore_unknown: bool,
    empty_ok: bool,
) -> Result<()> {
    if names.is_empty() && !empty_ok {
        return Err(Error::validation("empty config item list"));
    }
    for name in names {
        if name.is_empty() {
            return Err(Error::validation("empty config item name"));
        }
        if !ignore_unknown && !items.contains_key(name) {
            return Err(Error::not_found(format!("unknown config item: {name}")));
        }
    }
    Ok(())
}

fn describe(items: &[ConfigSetItem]) -> String {
    items
        .iter()
        .map(|i| format!("{}={:?}", i.name, i.value))
        .collect::<Vec<_>>()
        .join(", ")
}

impl ServiceHandler for ConfigManager {
    fn methods(self: Arc<Self>) -> MethodTable {
        let get = self.clone();
        let set = self.clone();
        let reset = self;
        MethodTable::new()
            .unary("get", move |req: Filter, _ctx| {
                let this = get.clone();
                async move { this.get(req).await }
            })
            .unary("set", move |req: ConfigUpdate, _ctx| {
                let this = set.clone();
                async move { this.set(req).await }
            })
            .unary("reset", move |req: Filter, _ctx| {
                let this = reset.clone();
                async move { this.reset(req).await }
            })
    }
}

#[async_trait]
impl LifecycleHooks for ConfigManager {
    fn name(&self) -> &str {
        "config"
    }

    async fn load(&self, ctx: &ManagerContext) -> Result<()> {
        let _ = self.ctx.set(ctx.clone());
        for item in self.store.views(Mutability::User) {
            tracing::debug!("[user] {}: {:?} (default: {:?})", item.name, item.value, item.default_value);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigItem;
    use crate::folders::Folders;
    use crate::types::ResultCode;

    fn manager(dir: &std::path::Path) -> ConfigManager {
        let store = Arc::new(ConfigStore::new(Folders::new(dir), BTreeMap::new()));
        store
            .register(vec![
                ConfigItem::new("color", "blue").with_mutability(Mutability::User),
                ConfigItem::new("depth", "3").with_mutability(Mutability::User),
                ConfigItem::new("frozen", "x").with_mutability(Mutability::Static),
            ])
            .unwrap();
        store.load().unwrap();
        ConfigManager::new(store)
    }

    fn names(names: &[&str]) -> Filter {
        Filter::names(names.iter().copied())
    }

    #[tokio::test]
    async fn test_get_lists_user_items_only() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());

        let all = manager.get(Filter::default()).await.unwrap();
        let listed: Vec<&str> = all.items.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(listed, vec!["color", "depth"]);

        let err = manager.get(names(&["frozen"])).await.unwrap_err();
        assert_eq!(err.code(), ResultCode::ErrorNotFound);
        let err = manager.get(names(&[""])).await.unwrap_err();
        assert_eq!(err.code(), ResultCode::ErrorValidation);
    }

    #[tokio::test]
    async fn test_set_then_reset() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());

        let update = ConfigUpdate {
            items: vec![ConfigSetItem {
                name: "color".into(),
                value: "red".into(),
            }],
            ignore_unknown: false,
        };
        let status = manager.set(update).await.unwrap();
        assert_eq!(status.items[0].value, "red");
        assert_eq!(manager.store.get("color").unwrap().value, "red");

        let status = manager.reset(names(&["color"])).await.unwrap();
        assert_eq!(status.items[0].value, "blue");
    }

    #[tokio::test]
    async fn test_set_rejects_bad_requests() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path());

        let err = manager.set(ConfigUpdate::default()).await.unwrap_err();
        assert_eq!(err.code(), ResultCode::ErrorValidation);

        let unknown = ConfigUpdate {
            items: vec![ConfigSetItem {
                name: "nope".into(),
                value: "1".into(),
            }],
            ignore_unknown: false,
        };
        let err = manager.set(unknown.clone()).await.unwrap_err();
        assert_eq!(err.code(), ResultCode::ErrorNotFound);

        let ignored = ConfigUpdate {
            ignore_unknown: true,
            ..unknown
        };
        assert!(manager.set(ignored).await.unwrap().items.is_empty());

        let err = manager.reset(Filter::default()).await.unwrap_err();
        assert_eq!(err.code(), ResultCode::ErrorValidation);
    }
}
