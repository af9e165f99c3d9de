use async_trait::async_trait;
use batchloader::{align_by_key, BatchFn, Keyed};

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Records what it was asked for and refuses to fetch a key twice.
#[derive(Clone, Default)]
pub struct LoadFnWithHistory {
    pub loaded_keys: Arc<Mutex<HashSet<usize>>>,
    pub max_batch_loaded: Arc<Mutex<usize>>,
    pub invoke_cnt: Arc<AtomicUsize>,
}

#[async_trait]
impl BatchFn<usize, usize> for LoadFnWithHistory {
    type Error = String;

    async fn load(&self, keys: &[usize]) -> Result<Vec<Result<usize, String>>, String> {
        self.invoke_cnt.fetch_add(1, Ordering::SeqCst);
        let mut loaded_keys = self.loaded_keys.lock().unwrap();
        let mut max_batch_loaded = self.max_batch_loaded.lock().unwrap();
        if keys.len() > *max_batch_loaded {
            *max_batch_loaded = keys.len();
        }
        for k in keys {
            if !loaded_keys.insert(*k) {
                panic!("already loaded, loader should not request same key");
            }
        }
        Ok(keys.iter().map(|v| Ok(*v)).collect())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct User {
    pub id: i64,
    pub name: String,
}

impl Keyed<i64> for User {
    fn key(&self) -> i64 {
        self.id
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Post {
    pub id: i64,
    pub user_id: i64,
    pub title: String,
}

impl Keyed<i64> for Post {
    fn key(&self) -> i64 {
        self.id
    }
}

/// In-memory stand-in for the upstream REST service: ten users, two posts
/// each. Counts every call the way a mock server would.
#[derive(Clone, Default)]
pub struct Upstream {
    pub calls: Arc<Mutex<Vec<String>>>,
}

impl Upstream {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn user(id: i64) -> Option<User> {
        (1..=10).contains(&id).then(|| User {
            id,
            name: format!("user {}", id),
        })
    }

    pub async fn posts(&self) -> Result<Vec<Post>, String> {
        self.calls.lock().unwrap().push("GET /posts".to_string());
        Ok((1..=20)
            .map(|id| Post {
                id,
                user_id: (id + 1) / 2,
                title: format!("post {}", id),
            })
            .collect())
    }

    /// `GET /users?id=..`: answers with the users it knows, skipping the rest.
    pub async fn users_by_id(&self, ids: &[i64]) -> Result<Vec<User>, String> {
        let query = ids
            .iter()
            .map(|id| format!("id={}", id))
            .collect::<Vec<_>>()
            .join("&");
        self.calls
            .lock()
            .unwrap()
            .push(format!("GET /users?{}", query));
        Ok(ids.iter().rev().filter_map(|id| Self::user(*id)).collect())
    }
}

pub struct UserBatcher(pub Upstream);

#[async_trait]
impl BatchFn<i64, User> for UserBatcher {
    type Error = String;

    async fn load(&self, keys: &[i64]) -> Result<Vec<Result<User, String>>, String> {
        let users = self.0.users_by_id(keys).await?;
        Ok(align_by_key(keys, users, |id| format!("user {} not found", id)))
    }
}
