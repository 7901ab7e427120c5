use std::sync::Arc;

use serde_json::Value;

use crate::models::accounts::{Account, SpendingHistoryEntry};
use crate::repositories::store::{
    check_segment, decode, encode, paths, Apply, DocumentStore, Outcome, StoreError,
};

#[derive(Debug)]
pub enum AccountMutation {
    Committed {
        account: Account,
        entry: Option<SpendingHistoryEntry>,
    },
    /// The mutation declined to commit; carries the account it saw.
    Aborted(Option<Account>),
}

#[derive(Clone)]
pub struct AccountRepository {
    store: Arc<dyn DocumentStore>,
}

impl AccountRepository {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    pub async fn get_account(&self, user_id: &str) -> Result<Option<Account>, StoreError> {
        check_segment(user_id)?;
        let path = paths::account(user_id);
        let value = self.store.get(&path).await?;
        decode(&path, value.as_ref())
    }

    pub async fn history(&self, user_id: &str) -> Result<Vec<SpendingHistoryEntry>, StoreError> {
        check_segment(user_id)?;
        let path = paths::spending_history(user_id);
        let children = self.store.children(&path).await?;

        children
            .into_iter()
            .filter_map(|(key, value)| {
                decode::<SpendingHistoryEntry>(&format!("{path}/{key}"), Some(&value)).transpose()
            })
            .collect()
    }

    /// Compare-and-apply over the account and, when `entry_key` is given, one
    /// new spending-history entry committed in the same write.
    ///
    /// `mutation` sees the current account (`None` if absent) and returns the
    /// replacement plus an optional audit entry, or `None` to abort. It may be
    /// called more than once.
    pub async fn mutate<F>(
        &self,
        user_id: &str,
        entry_key: Option<&str>,
        mutation: F,
    ) -> Result<AccountMutation, StoreError>
    where
        F: Fn(Option<Account>) -> Option<(Account, Option<SpendingHistoryEntry>)> + Send + Sync,
    {
        check_segment(user_id)?;
        let account_path = paths::account(user_id);
        let mut targets = vec![account_path.clone()];
        if let Some(key) = entry_key {
            check_segment(key)?;
            targets.push(paths::spending_entry(user_id, key));
        }

        let apply = |values: &[Option<Value>]| -> Result<Apply, StoreError> {
            let current: Option<Account> = decode(&account_path, values[0].as_ref())?;
            let Some((account, entry)) = mutation(current) else {
                return Ok(Apply::Abort);
            };

            let mut writes = vec![Some(encode(&account_path, &account)?)];
            if targets.len() > 1 {
                writes.push(match entry {
                    Some(entry) => Some(encode(&targets[1], &entry)?),
                    None => values[1].clone(),
                });
            }
            Ok(Apply::Commit(writes))
        };

        match self.store.compare_and_apply_many(&targets, &apply).await? {
            Outcome::Committed(values) => {
                let account = decode(&account_path, values[0].as_ref())?.unwrap_or_default();
                let entry = match values.get(1) {
                    Some(value) => decode(&targets[1], value.as_ref())?,
                    None => None,
                };
                Ok(AccountMutation::Committed { account, entry })
            }
            Outcome::Aborted(values) => {
                Ok(AccountMutation::Aborted(decode(&account_path, values[0].as_ref())?))
            }
        }
    }
}
