//! Self-dispatching loader: handles flush their own batch after yielding to
//! the runtime, so no scope or explicit flush is needed.

use async_trait::async_trait;
use batchloader::{BatchFn, Loader};
use std::thread;

struct MyLoadFn;

#[async_trait]
impl BatchFn<usize, usize> for MyLoadFn {
    type Error = ();

    async fn load(&self, keys: &[usize]) -> Result<Vec<Result<usize, ()>>, ()> {
        println!("BatchFn load keys {:?}", keys);
        Ok(keys.iter().map(|v| Ok(*v)).collect())
    }
}

fn main() {
    let loader = Loader::new(MyLoadFn)
        .with_max_batch_size(4)
        .with_yield_count(10);

    let l1 = loader.clone();
    let h1 = thread::spawn(move || {
        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .expect("runtime");
        rt.block_on(async {
            let r1 = l1.load(1);
            let r2 = l1.load(2);
            let r3 = l1.load(3);
            let r4 = l1.load_many(vec![2, 3, 4, 5, 6, 7, 8]);
            println!("{:?}", futures::future::join4(r1, r2, r3, r4).await);
        });
    });

    let l2 = loader.clone();
    let h2 = thread::spawn(move || {
        let rt = tokio::runtime::Builder::new_current_thread()
            .build()
            .expect("runtime");
        rt.block_on(async {
            let r = futures::future::join4(l2.load(1), l2.load(2), l2.load(3), l2.load(4));
            println!("{:?}", r.await);
        });
    });

    h1.join().unwrap();
    h2.join().unwrap();
}
