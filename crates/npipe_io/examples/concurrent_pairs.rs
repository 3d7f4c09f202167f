// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Runs a number of echo conversations concurrently, all dispatched by one completion registry.
//!
//! The pipes are provided by the in-process simulation, so this runs on every build target.
//! Raise the log level below to TRACE to see every operation.

use std::sync::Arc;
use std::thread;
use std::time::Instant;

use npipe_io::simulation::{SimulatedBindings, SimulatedPipeOptions};
use npipe_io::{CompletionRegistry, Error, PipeFile, PipeFileOptions, RegistryOptions};
use tracing::{Level, event};

const PAIRS: usize = 16;
const MESSAGES_PER_PAIR: usize = 100;

fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_thread_names(true)
        .init();

    let bindings = SimulatedBindings::new();
    let registry = CompletionRegistry::simulated(&bindings, &RegistryOptions::default())?;

    let started = Instant::now();

    thread::scope(|s| -> Result<(), Error> {
        let mut conversations = Vec::with_capacity(PAIRS);

        for pair in 0..PAIRS {
            let (server, client) = bindings.create_pipe(&SimulatedPipeOptions::default());
            let server =
                PipeFile::with_registry(server, Arc::clone(&registry), &PipeFileOptions::default());
            let client =
                PipeFile::with_registry(client, Arc::clone(&registry), &PipeFileOptions::default());

            s.spawn(move || echo(&server));
            conversations.push(s.spawn(move || converse(pair, &client)));
        }

        for conversation in conversations {
            conversation
                .join()
                .map_err(|_panic| Error::ContractViolation("conversation panicked".to_string()))??;
        }

        Ok(())
    })?;

    let stats = registry.stats();

    event!(
        Level::INFO,
        message = "all conversations finished",
        pairs = PAIRS,
        messages = PAIRS * MESSAGES_PER_PAIR,
        elapsed = ?started.elapsed(),
        delivered = stats.delivered,
        dropped_deliveries = stats.dropped_deliveries,
        spurious_wakeups = stats.spurious_wakeups,
        restarts = stats.restarts,
    );

    Ok(())
}

/// Sends every received message back until the peer closes the pipe.
fn echo(pipe: &PipeFile) {
    let mut buffer = [0u8; 256];

    loop {
        match pipe.read(&mut buffer) {
            Ok(len) => {
                if let Err(error) = pipe.write(&buffer[..len]) {
                    event!(Level::WARN, message = "echo failed", %error);
                    return;
                }
            }
            Err(Error::EndOfStream) => return,
            Err(error) => {
                event!(Level::WARN, message = "echo read failed", %error);
                return;
            }
        }
    }
}

fn converse(pair: usize, pipe: &PipeFile) -> Result<(), Error> {
    let mut buffer = [0u8; 256];

    for index in 0..MESSAGES_PER_PAIR {
        let message = format!("pair {pair} message {index}");
        pipe.write(message.as_bytes())?;

        let mut received = 0;
        while received < message.len() {
            received += pipe.read(&mut buffer[received..])?;
        }

        if &buffer[..received] != message.as_bytes() {
            return Err(Error::ContractViolation(format!(
                "pair {pair} received a reply that does not match its message"
            )));
        }
    }

    event!(Level::INFO, message = "conversation finished", pair);

    pipe.close()
}
