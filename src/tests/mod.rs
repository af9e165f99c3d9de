use crate::BatchFn;

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};

use async_trait::async_trait;


#[derive(Clone, Default)]
pub struct Batcher {
    invoke_cnt: Arc<AtomicUsize>,
    batches: Arc<Mutex<Vec<Vec<i32>>>>,
}

impl Batcher {
    pub fn new() -> Batcher {
        Batcher::default()
    }

    pub fn invoke_cnt(&self) -> usize {
        self.invoke_cnt.load(Ordering::SeqCst)
    }

    pub fn batches(&self) -> Vec<Vec<i32>> {
        self.batches.lock().unwrap().clone()
    }
}

#[async_trait]
impl BatchFn<i32, i32> for Batcher {
    type Error = MyError;

    async fn load(&self, keys: &[i32]) -> Result<Vec<Result<i32, MyError>>, MyError> {
        self.invoke_cnt.fetch_add(1, Ordering::SeqCst);
        self.batches.lock().unwrap().push(keys.to_vec());
        Ok(keys.iter().map(|v| Ok(v * 10)).collect())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum MyError {
    Unknown,
    NotEven,
}

/// Fails every batch as a whole.
pub struct BadBatcher;

#[async_trait]
impl BatchFn<i32, i32> for BadBatcher {
    type Error = MyError;

    async fn load(&self, _keys: &[i32]) -> Result<Vec<Result<i32, MyError>>, MyError> {
        Err(MyError::Unknown)
    }
}

/// Fails odd keys only.
pub struct EvenBatcher;

#[async_trait]
impl BatchFn<i32, i32> for EvenBatcher {
    type Error = MyError;

    async fn load(&self, keys: &[i32]) -> Result<Vec<Result<i32, MyError>>, MyError> {
        Ok(keys
            .iter()
            .map(|v| {
                if v % 2 == 0 {
                    Ok(v * 10)
                } else {
                    Err(MyError::NotEven)
                }
            })
            .collect())
    }
}

/// Always drops the last result.
pub struct ShortBatcher;

#[async_trait]
impl BatchFn<i32, i32> for ShortBatcher {
    type Error = MyError;

    async fn load(&self, keys: &[i32]) -> Result<Vec<Result<i32, MyError>>, MyError> {
        Ok(keys.iter().skip(1).map(|v| Ok(v * 10)).collect())
    }
}

/// Answers one key too many.
pub struct LongBatcher;

#[async_trait]
impl BatchFn<i32, i32> for LongBatcher {
    type Error = MyError;

    async fn load(&self, keys: &[i32]) -> Result<Vec<Result<i32, MyError>>, MyError> {
        Ok(keys.iter().chain(keys.last()).map(|v| Ok(v * 10)).collect())
    }
}
