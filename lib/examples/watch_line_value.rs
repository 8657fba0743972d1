// SPDX-FileCopyrightText: 2021 Kent Gibson <warthog618@gmail.com>
//
// SPDX-License-Identifier: Apache-2.0 OR MIT

// Example of watching for edge events on a single line, giving up after a
// period of time.

use anyhow::Context;
use pingo::line::EdgeDetection;
use pingo::{CancelToken, Device};
use std::thread;
use std::time::Duration;

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let device = Device::builder()
        .on_chip("/dev/gpiochip0")
        .with_consumer("watch-line-value")
        .open()
        .context("Failed to open chip")?;
    let line = device
        .request_interrupt(23, EdgeDetection::BothEdges)
        .context("Failed to request line")?;

    let cancel = CancelToken::new()?;
    let timer = cancel.clone();
    thread::spawn(move || {
        thread::sleep(Duration::from_secs(30));
        timer.cancel();
    });

    for event in line.subscribe(&cancel)? {
        println!("{:?}", event);
    }
    println!("done");

    device.shutdown();
    Ok(())
}
