//! Counter demo.
//!
//! Each visitor gets a private counter and a history of its last clicks
//! that survives reconnects; everyone sees the shared visitor count. Pass a
//! JSON config path as the only argument to override the defaults.

use patchwire_core::protocol::{EventFrame, Hello};
use patchwire_core::render::{component, el, keyed_list, Component};
use patchwire_core::{server, GlobalSignal, ServerConfig};
use tracing_subscriber::EnvFilter;

fn app(visitors: GlobalSignal<u64>) -> impl Fn(&Hello) -> Component + Send + Sync {
    move |hello: &Hello| {
        if hello.resume_token.is_none() {
            visitors.update(|n| *n += 1);
        }
        let width = hello.viewport.width;
        component("counter", move |cx| {
            let count = cx.use_signal(|| 0i64);
            let history = cx.use_persisted("history", Vec::<i64>::new);
            let doubled = {
                let count = count.clone();
                cx.use_memo(move || count.get() * 2)
            };

            let bump = |by: i64| {
                let count = count.clone();
                let history = history.clone();
                move |_: &EventFrame| {
                    count.update(|n| *n += by);
                    history.update(|h| {
                        h.push(by);
                        if h.len() > 5 {
                            h.remove(0);
                        }
                    });
                }
            };

            let entries: Vec<(usize, i64)> = history.get().into_iter().enumerate().collect();
            el("main")
                .attr("data-width", width.to_string())
                .child(el("h1").text(format!("visitors: {}", visitors.get())))
                .child(el("button").text("-").on("click", bump(-1)))
                .child(el("span").text(count.get().to_string()))
                .child(el("button").text("+").on("click", bump(1)))
                .child(el("p").text(format!("doubled: {}", doubled.get())))
                .child(
                    el("ul").child(keyed_list(
                        entries,
                        |(i, _)| i.to_string(),
                        |(_, by)| el("li").text(format!("{by:+}")).into(),
                    )),
                )
                .into()
        })
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .compact()
        .with_target(false)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => match ServerConfig::load(&path) {
            Ok(config) => config,
            Err(err) => {
                tracing::error!(path, error = %err, "invalid config");
                std::process::exit(2);
            }
        },
        None => ServerConfig::default(),
    };

    let visitors = GlobalSignal::new(0u64);
    if let Err(err) = server::run(config, app(visitors)).await {
        tracing::error!(error = %err, "server stopped");
        std::process::exit(1);
    }
}
