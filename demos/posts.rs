//! Resolves `{ posts { title user { name } } }` against an in-memory
//! upstream, showing one request context per query and the two upstream
//! calls the whole query boils down to.
//!
//! RUST_LOG=batchloader=debug cargo run --example posts

use async_trait::async_trait;
use batchloader::{align_by_key, BatchFn, Keyed, LoadError, Loader, RequestCache, RequestScope};
use futures::future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone)]
struct User {
    id: i64,
    name: String,
}

impl Keyed<i64> for User {
    fn key(&self) -> i64 {
        self.id
    }
}

#[derive(Debug, Clone)]
struct Post {
    id: i64,
    user_id: i64,
    title: String,
}

impl Keyed<i64> for Post {
    fn key(&self) -> i64 {
        self.id
    }
}

#[derive(Clone, Default)]
struct Upstream {
    calls: Arc<AtomicUsize>,
}

impl Upstream {
    async fn posts(&self) -> Result<Vec<Post>, String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        println!("GET /posts");
        Ok((1..=6)
            .map(|id| Post {
                id,
                user_id: (id + 1) / 2,
                title: format!("post #{}", id),
            })
            .collect())
    }

    async fn users(&self, ids: &[i64]) -> Result<Vec<User>, String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        println!("GET /users?id={:?}", ids);
        Ok(ids
            .iter()
            .map(|&id| User {
                id,
                name: format!("user #{}", id),
            })
            .collect())
    }
}

struct UserBatcher(Upstream);

#[async_trait]
impl BatchFn<i64, User> for UserBatcher {
    type Error = String;

    async fn load(&self, keys: &[i64]) -> Result<Vec<Result<User, String>>, String> {
        let users = self.0.users(keys).await?;
        Ok(align_by_key(keys, users, |id| format!("no user {}", id)))
    }
}

struct RequestContext {
    upstream: Upstream,
    users: Loader<i64, User, UserBatcher>,
    posts: RequestCache<i64, Post, &'static str>,
}

async fn posts(ctx: &RequestContext) -> Result<Vec<Post>, String> {
    let (posts, from_cache) = ctx
        .posts
        .get_or_fetch_list("all", || ctx.upstream.posts())
        .await?;
    println!("posts from cache: {}", from_cache);
    Ok(posts.to_vec())
}

async fn post_user(ctx: &RequestContext, post: &Post) -> Result<User, LoadError<String>> {
    ctx.users.load(post.user_id).await
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let upstream = Upstream::default();
    let scope = RequestScope::new();
    let ctx = RequestContext {
        users: scope.loader(UserBatcher(upstream.clone())),
        posts: RequestCache::new(),
        upstream: upstream.clone(),
    };

    let rows = scope
        .run(async {
            let posts = posts(&ctx).await?;
            let users = future::join_all(posts.iter().map(|post| post_user(&ctx, post))).await;
            Ok::<_, String>(posts.into_iter().zip(users).collect::<Vec<_>>())
        })
        .await;

    match rows {
        Ok(rows) => {
            for (post, user) in rows {
                match user {
                    Ok(user) => println!("{} by {}", post.title, user.name),
                    Err(e) => println!("{}: {}", post.title, e),
                }
            }
        }
        Err(e) => eprintln!("query failed: {}", e),
    }
    println!("upstream calls: {}", upstream.calls.load(Ordering::SeqCst));
}
