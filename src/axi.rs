// Copyright (C) 2020  Braiins Systems s.r.o.
//
// This file is part of Braiins Open-Source Initiative (BOSI).
//
// BOSI is free software: you can redistribute it and/or modify
// it under the terms of the GNU Common Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Common Public License for more details.
//
// You should have received a copy of the GNU Common Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.
//
// Please, keep in mind that we may also license BOSI or any part thereof
// under a proprietary license. For more information on the terms and conditions
// of such proprietary license or if you have any other questions, please
// contact us at opensource@braiins.com.

//! AXI transport contract consumed by the driver.
//!
//! It is split into two layers:
//!   * the `Bus` trait, which is everything the driver state machine needs:
//!     32-bit register traffic, bulk writes with optional byte-swap, CDMA
//!     block copies and interrupt arming/waiting
//!   * `Tcp`, a client for the board's TCP register bridge implementing that
//!     trait
//!
//! Every operation fails with `ErrorKind::Axi`; `wait_for_interrupt`
//! additionally reports a timeout as a distinct, non-fault outcome.

use crate::error::{self, ErrorKind};

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Mutex;
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};

/// Outcome of waiting for a nonce interrupt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum IrqWait {
    /// Interrupt fired; the 64-bit payload is a candidate nonce.
    Nonce(u64),
    /// No interrupt within the requested window. Not a fault.
    TimedOut,
}

/// Synchronous register-level transport to one board.
///
/// The trait is object-safe on purpose: the driver owns exactly one handle
/// per device and serializes register traffic with its own lock, while the
/// interrupt wait is allowed to proceed concurrently (the bridge keeps a
/// dedicated channel for it).
pub trait Bus: Send + Sync {
    /// Read a 32-bit register.
    fn read(&self, addr: u32) -> error::Result<u32>;

    /// Write a 32-bit register. With `wait` the call returns only after the
    /// bridge acknowledges the write has been issued on the fabric.
    fn write(&self, value: u32, addr: u32, wait: bool) -> error::Result<()>;

    /// Write a block of bytes starting at `addr`. With `byte_swap` the bridge
    /// reverses byte order within each 32-bit word before issuing it.
    fn bulk_write(&self, data: &[u8], addr: u32, byte_swap: bool) -> error::Result<()>;

    /// On-board CDMA block copy between 64-bit fabric addresses.
    fn cdma_copy(&self, src: u64, dst: u64, len: u64) -> error::Result<()>;

    /// Push a host buffer to a 64-bit fabric address through CDMA.
    fn cdma_write(&self, data: &[u8], addr: u64) -> error::Result<()>;

    /// Arm interrupt delivery for the given mask.
    fn enable_interrupts(&self, mask: u32) -> error::Result<()>;

    /// Block until an armed interrupt fires or `timeout` elapses.
    fn wait_for_interrupt(&self, mask: u32, timeout: Duration) -> error::Result<IrqWait>;

    /// Make any outstanding `wait_for_interrupt` return immediately.
    fn kick_interrupts(&self) -> error::Result<()>;

    /// Set the per-call timeout applied to register and CDMA traffic.
    fn set_timeout(&self, timeout: Duration);
}

/// Bridge opcodes. One request frame per `Bus` call.
const OP_READ: u8 = 0x01;
const OP_WRITE: u8 = 0x02;
const OP_BULK_WRITE: u8 = 0x03;
const OP_CDMA_COPY: u8 = 0x04;
const OP_CDMA_WRITE: u8 = 0x05;
const OP_IRQ_ENABLE: u8 = 0x06;
const OP_IRQ_WAIT: u8 = 0x07;
const OP_IRQ_KICK: u8 = 0x08;

/// Response status codes.
const ST_OK: u8 = 0x00;
const ST_TIMEOUT: u8 = 0x01;

/// Extra slack on top of the bridge-side interrupt timeout so that a healthy
/// bridge always answers before the socket gives up.
const IRQ_SOCKET_SLACK: Duration = Duration::from_secs(2);

/// TCP client for the board's AXI register bridge.
///
/// Two connections are kept: `ctrl` carries register/bulk/CDMA traffic and
/// the interrupt kick, `irq` is dedicated to the blocking interrupt wait so
/// that a kick can overtake a wait already in flight.
pub struct Tcp {
    ctrl: Mutex<TcpStream>,
    irq: Mutex<TcpStream>,
}

impl Tcp {
    pub fn connect(host: &str, port: u16, timeout: Duration) -> error::Result<Self> {
        let ctrl = Self::open(host, port, timeout)?;
        let irq = Self::open(host, port, timeout)?;
        Ok(Self {
            ctrl: Mutex::new(ctrl),
            irq: Mutex::new(irq),
        })
    }

    fn open(host: &str, port: u16, timeout: Duration) -> error::Result<TcpStream> {
        let stream = TcpStream::connect((host, port))
            .map_err(|e| ErrorKind::Axi(format!("connect {}:{}: {}", host, port, e)))?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;
        Ok(stream)
    }

    /// Send one request frame and read back `resp_len` payload bytes.
    fn transact(stream: &mut TcpStream, frame: &[u8], resp: &mut [u8]) -> error::Result<u8> {
        stream
            .write_all(frame)
            .map_err(|e| ErrorKind::Axi(format!("request: {}", e)))?;
        let mut status = [0u8; 1];
        stream
            .read_exact(&mut status)
            .map_err(|e| ErrorKind::Axi(format!("response status: {}", e)))?;
        if !resp.is_empty() {
            stream
                .read_exact(resp)
                .map_err(|e| ErrorKind::Axi(format!("response payload: {}", e)))?;
        }
        Ok(status[0])
    }

    fn ctrl_transact(&self, frame: &[u8], resp: &mut [u8]) -> error::Result<u8> {
        let mut stream = self.ctrl.lock().expect("BUG: AXI control stream poisoned");
        Self::transact(&mut stream, frame, resp)
    }

    fn check_status(status: u8, what: &str) -> error::Result<()> {
        if status != ST_OK {
            Err(ErrorKind::Axi(format!("{}: bridge status {:#04x}", what, status)))?
        }
        Ok(())
    }
}

impl Bus for Tcp {
    fn read(&self, addr: u32) -> error::Result<u32> {
        let mut frame = [0u8; 5];
        frame[0] = OP_READ;
        LittleEndian::write_u32(&mut frame[1..5], addr);
        let mut value = [0u8; 4];
        let status = self.ctrl_transact(&frame, &mut value)?;
        Self::check_status(status, "read")?;
        Ok(LittleEndian::read_u32(&value))
    }

    fn write(&self, value: u32, addr: u32, wait: bool) -> error::Result<()> {
        let mut frame = [0u8; 10];
        frame[0] = OP_WRITE;
        LittleEndian::write_u32(&mut frame[1..5], addr);
        LittleEndian::write_u32(&mut frame[5..9], value);
        frame[9] = wait as u8;
        let status = self.ctrl_transact(&frame, &mut [])?;
        Self::check_status(status, "write")
    }

    fn bulk_write(&self, data: &[u8], addr: u32, byte_swap: bool) -> error::Result<()> {
        let mut frame = Vec::with_capacity(10 + data.len());
        frame.push(OP_BULK_WRITE);
        let mut header = [0u8; 9];
        LittleEndian::write_u32(&mut header[0..4], addr);
        header[4] = byte_swap as u8;
        LittleEndian::write_u32(&mut header[5..9], data.len() as u32);
        frame.extend_from_slice(&header);
        frame.extend_from_slice(data);
        let status = self.ctrl_transact(&frame, &mut [])?;
        Self::check_status(status, "bulk write")
    }

    fn cdma_copy(&self, src: u64, dst: u64, len: u64) -> error::Result<()> {
        let mut frame = [0u8; 25];
        frame[0] = OP_CDMA_COPY;
        LittleEndian::write_u64(&mut frame[1..9], src);
        LittleEndian::write_u64(&mut frame[9..17], dst);
        LittleEndian::write_u64(&mut frame[17..25], len);
        let status = self.ctrl_transact(&frame, &mut [])?;
        Self::check_status(status, "cdma copy")
    }

    fn cdma_write(&self, data: &[u8], addr: u64) -> error::Result<()> {
        let mut frame = Vec::with_capacity(13 + data.len());
        frame.push(OP_CDMA_WRITE);
        let mut header = [0u8; 12];
        LittleEndian::write_u64(&mut header[0..8], addr);
        LittleEndian::write_u32(&mut header[8..12], data.len() as u32);
        frame.extend_from_slice(&header);
        frame.extend_from_slice(data);
        let status = self.ctrl_transact(&frame, &mut [])?;
        Self::check_status(status, "cdma write")
    }

    fn enable_interrupts(&self, mask: u32) -> error::Result<()> {
        let mut frame = [0u8; 5];
        frame[0] = OP_IRQ_ENABLE;
        LittleEndian::write_u32(&mut frame[1..5], mask);
        let status = self.ctrl_transact(&frame, &mut [])?;
        Self::check_status(status, "irq enable")
    }

    fn wait_for_interrupt(&self, mask: u32, timeout: Duration) -> error::Result<IrqWait> {
        let mut frame = [0u8; 9];
        frame[0] = OP_IRQ_WAIT;
        LittleEndian::write_u32(&mut frame[1..5], mask);
        LittleEndian::write_u32(&mut frame[5..9], timeout.as_millis() as u32);

        let mut stream = self.irq.lock().expect("BUG: AXI irq stream poisoned");
        // The bridge enforces the timeout; the socket deadline only guards
        // against a dead peer.
        stream.set_read_timeout(Some(timeout + IRQ_SOCKET_SLACK))?;
        let mut payload = [0u8; 8];
        let status = Self::transact(&mut stream, &frame, &mut payload)?;
        match status {
            ST_OK => Ok(IrqWait::Nonce(LittleEndian::read_u64(&payload))),
            ST_TIMEOUT => Ok(IrqWait::TimedOut),
            other => Err(ErrorKind::Axi(format!("irq wait: bridge status {:#04x}", other)).into()),
        }
    }

    fn kick_interrupts(&self) -> error::Result<()> {
        let status = self.ctrl_transact(&[OP_IRQ_KICK], &mut [])?;
        Self::check_status(status, "irq kick")
    }

    fn set_timeout(&self, timeout: Duration) {
        let stream = self.ctrl.lock().expect("BUG: AXI control stream poisoned");
        // A zero duration would disable the deadline entirely, never ask for it
        let timeout = Some(timeout.max(Duration::from_millis(1)));
        let _ = stream.set_read_timeout(timeout);
        let _ = stream.set_write_timeout(timeout);
    }
}
