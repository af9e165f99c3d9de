//! Drives the scheduling boundary by hand with `Loader::flush`.

use batchloader::{batch_fn, Loader};
use futures::executor::block_on;
use futures::future;

fn main() {
    let loader = Loader::new(batch_fn(|keys: Vec<u32>| async move {
        println!("load batch {:?}", keys);
        Ok::<Vec<Result<u32, String>>, String>(
            keys.into_iter()
                .map(|k| {
                    if k == 0 {
                        Err("zero is not a valid id".to_string())
                    } else {
                        Ok(k * 100)
                    }
                })
                .collect(),
        )
    }));

    let handles = vec![loader.load(1), loader.load(2), loader.load(1), loader.load(0)];
    println!("pending keys: {}", loader.pending_len());
    block_on(loader.flush());
    for result in block_on(future::join_all(handles)) {
        println!("{:?}", result);
    }

    // served from cache, no batch
    let v = block_on(loader.load(2));
    println!("{:?}, pending keys: {}", v, loader.pending_len());
}
