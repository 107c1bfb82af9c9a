use std::future::Future;

pub(crate) fn spawn_local<T: 'static>(f: impl Future<Output = T> + 'static) {
    #[cfg(not(target_arch = "wasm32"))]
    drop(tokio::task::spawn_local(async move {
        drop(f.await);
    }));
    #[cfg(target_arch = "wasm32")]
    wasm_bindgen_futures::spawn_local(async move {
        drop(f.await);
    });
}
