// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
use std::env;
use std::process;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use embersql::ember_config;
use embersql::ember_logging;
use embersql::runtime::exec_env::ExecEnv;

fn main() {
    let mut config_path: Option<String> = None;
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => match args.next() {
                Some(p) => config_path = Some(p),
                None => {
                    eprintln!("missing value for --config/-c");
                    process::exit(1);
                }
            },
            "--help" | "-h" => {
                eprintln!("Usage: embersqld [--config <path>]");
                process::exit(0);
            }
            other => {
                eprintln!("unknown arg: {other} (try --help)");
                process::exit(1);
            }
        }
    }

    let cfg = match config_path.as_deref() {
        Some(p) => ember_config::init_from_path(p).expect("load embersql config"),
        None => ember_config::init_from_env_or_default().expect("load embersql config"),
    };

    // `log_filter` is a full EnvFilter expression and wins over `log_level`;
    // bare debug/trace levels apply to our crate only, keeping dependencies
    // at info.
    let filter = match (&cfg.log_filter, cfg.log_level.as_str()) {
        (Some(f), _) => f.clone(),
        (None, "debug") => "info,embersql=debug".to_string(),
        (None, "trace") => "info,embersql=trace".to_string(),
        (None, level) => level.to_string(),
    };
    ember_logging::init_with_level(&filter);

    let running = Arc::new(AtomicBool::new(true));
    let handler_flag = Arc::clone(&running);
    ctrlc::set_handler(move || {
        println!("\nreceived interrupt, shutting down...");
        handler_flag.store(false, Ordering::SeqCst);
    })
    .expect("install Ctrl-C handler");

    let exec_env = ExecEnv::new(cfg).expect("build exec env");
    let server = exec_env
        .start_message_server(cfg)
        .expect("start message server");

    println!(
        "embersqld started (node={}, comm={}, cluster_size={})",
        exec_env.self_node().id,
        server.local_addr(),
        exec_env.nodes().len()
    );
    println!("Press Ctrl-C to stop...");

    while running.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(100));
    }

    server.shutdown();
    exec_env.shutdown();
    println!("embersqld stopped");
}
