// SPDX-FileCopyrightText: 2021 Kent Gibson <warthog618@gmail.com>
//
// SPDX-License-Identifier: Apache-2.0 OR MIT

// Basic example of toggling a single line.

use anyhow::Context;
use pingo::line::Value;
use pingo::Device;
use std::thread;
use std::time::Duration;

fn main() -> anyhow::Result<()> {
    let offset = 22;
    let device = Device::builder()
        .on_chip("/dev/gpiochip0")
        .with_consumer("toggle-line-value")
        .open()
        .context("Failed to open chip")?;

    // outputs start inactive
    let line = device
        .request_output(offset)
        .context("Failed to request line")?;
    let mut value = Value::Inactive;

    loop {
        thread::sleep(Duration::from_millis(500));
        value = value.not();
        line.set(value).context("Failed to set value")?;
        println!("{}={}", offset, value);
    }
}
