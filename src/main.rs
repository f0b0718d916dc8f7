use std::{env, sync::Arc, time::Duration};

use tracing_subscriber::EnvFilter;

use jetstream_client::client::Client;
use jetstream_client::websocket::WebSocketAdapter;
use jetstream_model::model_class;
use jetstream_model::scope::Scope;

// ANSI color codes
const RESET: &str = "\x1b[0m";
const BOLD: &str = "\x1b[1m";
const CYAN: &str = "\x1b[36m";
const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[33m";

model_class! {
    /// Demo scope root: a canvas holding shapes.
    pub struct Canvas {
        name: string,
        shapes: array,
    }
}

model_class! {
    /// Demo entity with a derived property over its geometry.
    pub struct Shape {
        x: double,
        y: double,
        width: double,
        height: double,
        color: color,
        label: string,
    }
    composites {
        frame <- [x, y, width, height],
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let url = env::args()
        .nth(1)
        .unwrap_or_else(|| "ws://127.0.0.1:3000/jetstream".to_owned());
    let scope_name = env::args().nth(2).unwrap_or_else(|| "Canvas".to_owned());

    println!("{}{}Jetstream demo{}", BOLD, CYAN, RESET);
    println!("Connecting to {} (scope `{}`)", url, scope_name);

    Canvas::register();
    Shape::register();

    let client = Client::new(WebSocketAdapter::new(url));

    let (session_tx, mut session_rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    client.on_session().listen("demo", move |token| {
        let _ = session_tx.send(token.clone());
    });
    client.on_session_denied().listen("demo", |_| {
        eprintln!("Server denied the session; giving up.");
        std::process::exit(1);
    });

    client.connect();
    let token = session_rx
        .recv()
        .await
        .expect("client dispatcher went away before a session arrived");
    println!("{}Session established{} (token {})", GREEN, RESET, token);

    let scope = Scope::new(&scope_name);
    let scope_index = client
        .attach_scope(&scope)
        .await
        .expect("scope fetch failed");
    println!("Scope attached at index {}", scope_index);

    // Wait for the server's state dump to install the canvas.
    let root = loop {
        if let Some(root) = scope.root_model() {
            break root;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    };
    println!(
        "Root {} installed ({} objects)",
        root.uuid(),
        scope.object_count()
    );

    root.on_change().listen("demo", |change| {
        println!("{}canvas.{} changed{}", YELLOW, change.property, RESET);
    });

    // Push one local edit through the pipeline: a fresh shape appended to
    // the canvas. The scope coalesces this into a single ScopeSync.
    let canvas = Canvas::from(root.clone());
    let shape = Shape::new();
    shape.set_label("hello from jetstream_demo");
    shape.set_x(10.0);
    shape.set_y(20.0);
    shape.set_width(100.0);
    shape.set_height(60.0);
    shape.set_color(0x3366ccff);

    let mut shapes = canvas.shapes();
    shapes.push(Arc::clone(shape.model()));
    canvas.set_shapes(&shapes);
    println!("Appended shape {}", shape.uuid());

    // Stay online and print remote edits as they stream in.
    tokio::signal::ctrl_c()
        .await
        .expect("failed to wait for ctrl-c");
    println!("Shutting down");
    client.close();
}
