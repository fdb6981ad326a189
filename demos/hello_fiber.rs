// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Spawns a handful of tasks on the default runtime, has them coordinate
//! through a mutex and a sleep, and tears the runtime down once they're
//! done. Run with `cargo run --example hello_fiber`.

use fiber_rt::sync::Mutex;
use fiber_rt::{task, Runtime};
use std::sync::Arc;
use std::time::Duration;

fn main() {
    tracing_subscriber::fmt::init();

    let rt = Runtime::start_default().expect("failed to start runtime");
    let greeting = Arc::new(Mutex::new(String::new()));

    let writer_greeting = greeting.clone();
    let writer = rt
        .spawn_default(move || {
            writer_greeting.lock().unwrap().push_str("hello from a fiber");
        })
        .unwrap();
    writer.join().unwrap();

    let reader_greeting = greeting.clone();
    let reader = rt
        .spawn_default(move || {
            println!("{}", reader_greeting.lock().unwrap().as_str());
        })
        .unwrap();
    reader.join().unwrap();

    let sleeper = rt
        .spawn_default(|| match task::sleep_for(Duration::from_secs(5)) {
            Ok(()) => println!("slept the full five seconds"),
            Err(_) => println!("woken up early"),
        })
        .unwrap();
    std::thread::sleep(Duration::from_millis(50));
    sleeper.request_stop();
    sleeper.join().unwrap();

    rt.shutdown();
}
