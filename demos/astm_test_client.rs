//! A standalone ASTM test client exercising a running gateway over a real
//! TCP socket: ENQ, four frames (header, patient, order, result,
//! terminator), EOT, waiting for an ACK after each step.
//!
//! Not wired into `Cargo.toml` as a `[[bin]]`; run it with
//! `rustc --edition 2021 -L target/debug/deps --extern astm_lis_gateway=... demos/astm_test_client.rs`
//! against a gateway listening on the port given as the first argument
//! (default 5600).

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use astm_lis_gateway::protocol::constants::{ACK, ENQ, EOT};
use astm_lis_gateway::protocol::frame::build_frame;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let port: u16 = std::env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(5600);
    let addr = format!("127.0.0.1:{port}");

    println!("ASTM test client connecting to {addr}");
    let mut stream = TcpStream::connect(&addr)?;
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    stream.set_write_timeout(Some(Duration::from_secs(5)))?;

    println!("sending ENQ");
    stream.write_all(&[ENQ])?;
    expect_ack(&mut stream, "ENQ")?;

    let records = [
        b"H|\\^&||||||||||P|E 1394-97|20231205120000\r".to_vec(),
        b"P|1|PAT001|||SMITH^JOHN^M||19800101|M||123 MAIN ST^CITY^STATE^12345||DR SMITH|||175^CM|70^KG\r".to_vec(),
        b"O|1|S1||\r".to_vec(),
        b"R|1|^^^GLU|95|mg/dL|70-100||N|F||||20231205120000\r".to_vec(),
        b"L|1|N\r".to_vec(),
    ];

    for (i, data) in records.iter().enumerate() {
        let fn_seq = (i as u8 % 7) + 1;
        let is_last = i == records.len() - 1;
        let frame = build_frame(fn_seq, data, is_last)?;
        println!("sending frame {} ({} bytes of data)", i + 1, data.len());
        stream.write_all(&frame)?;
        expect_ack(&mut stream, &format!("frame {}", i + 1))?;
    }

    println!("sending EOT");
    stream.write_all(&[EOT])?;

    println!("test transmission complete");
    Ok(())
}

fn expect_ack(stream: &mut TcpStream, step: &str) -> Result<(), Box<dyn std::error::Error>> {
    let mut buffer = [0u8; 1];
    stream.read_exact(&mut buffer)?;
    if buffer[0] == ACK {
        println!("{step}: ACK");
        Ok(())
    } else {
        Err(format!("{step}: expected ACK, got 0x{:02X}", buffer[0]).into())
    }
}
