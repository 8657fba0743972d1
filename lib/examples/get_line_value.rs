// SPDX-FileCopyrightText: 2021 Kent Gibson <warthog618@gmail.com>
//
// SPDX-License-Identifier: Apache-2.0 OR MIT

// Basic example of reading a single line.

use pingo::Device;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let offset = 22;
    let device = Device::builder()
        .on_chip("/dev/gpiochip0")
        .with_consumer("get-line-value")
        .open()?;

    let line = device.request_input(offset)?;
    let value = line.get()?;
    println!("{offset}={value}");

    Ok(())
}
