//! A DS2490 in software, on top of a simulated 1-Wire bus.

use crate::{
    TransferError, UsbIo,
    registers::{COMM_CMD, CONTROL_CMD, RESULT_NRS, RESULT_SH, STATUS_PACKET_MAX},
    usb::{EP_DATA_IN, EP_DATA_OUT, EP_STATUS},
};
use alloc::{collections::VecDeque, vec::Vec};
use core::time::Duration;
use onewire_bus::sim::SimBus;

const OPCODE_MASK: u16 = 0x00f6;
const FLAG_RST: u16 = 0x0100;
const FLAG_D: u16 = 0x0008;

pub(crate) struct SimDs2490 {
    pub bus: SimBus,
    ep2: VecDeque<u8>,
    ep3: VecDeque<u8>,
    results: Vec<u8>,
    pub claimed: bool,
    pub busy: bool,
    pub unplugged: bool,
    pub stall_reads: usize,
    pub controls: Vec<(u8, u16, u16)>,
    pub halts_cleared: Vec<u8>,
}

impl SimDs2490 {
    pub fn new(bus: SimBus) -> Self {
        Self {
            bus,
            ep2: VecDeque::new(),
            ep3: VecDeque::new(),
            results: Vec::new(),
            claimed: false,
            busy: false,
            unplugged: false,
            stall_reads: 0,
            controls: Vec::new(),
            halts_cleared: Vec::new(),
        }
    }

    fn reset_pulse(&mut self) -> bool {
        let status = self.bus.reset_pulse();
        if status.short {
            self.results.push(RESULT_SH);
            false
        } else if !status.presence {
            self.results.push(RESULT_NRS);
            false
        } else {
            true
        }
    }

    fn comm(&mut self, value: u16, index: u16) {
        match value & OPCODE_MASK {
            0x0042 => {
                self.reset_pulse();
            }
            0x0020 => {
                let bit = self.bus.slot(value & FLAG_D != 0);
                self.ep3.push_back(bit as u8);
            }
            0x0052 => {
                let b = self.bus.touch(index as u8);
                self.ep3.push_back(b);
            }
            0x0074 => {
                for _ in 0..index {
                    let out = self.ep2.pop_front().unwrap_or(0xff);
                    let b = self.bus.touch(out);
                    self.ep3.push_back(b);
                }
            }
            0x0064 => {
                if value & FLAG_RST != 0 && !self.reset_pulse() {
                    self.ep2.clear();
                    return;
                }
                self.bus.touch(index as u8);
                for _ in 0..8 {
                    let b = self.ep2.pop_front().unwrap_or(0);
                    self.bus.touch(b);
                }
            }
            0x00f4 => self.search(index as u8),
            _ => {}
        }
    }

    fn search(&mut self, cmd: u8) {
        let replay: Vec<u8> = (0..8).map(|_| self.ep2.pop_front().unwrap_or(0)).collect();
        self.bus.touch(cmd);
        let mut rom = [0u8; 8];
        let mut disc = [0u8; 8];
        let mut more = false;
        for bit in 0..64usize {
            let mask = 1u8 << (bit % 8);
            let (id, complement, taken) = self.bus.triplet(replay[bit / 8] & mask != 0);
            if id && complement && bit == 0 {
                return;
            }
            if !id && !complement {
                disc[bit / 8] |= mask;
                more |= !taken;
            }
            if taken {
                rom[bit / 8] |= mask;
            }
        }
        self.ep3.extend(rom);
        if more {
            self.ep3.extend(disc);
        }
    }
}

impl UsbIo for SimDs2490 {
    type Error = ();

    fn claim(&mut self) -> Result<(), TransferError<Self::Error>> {
        if self.unplugged {
            return Err(TransferError::NoDevice);
        }
        self.claimed = true;
        Ok(())
    }

    fn release(&mut self) {
        self.claimed = false;
    }

    fn control_out(
        &mut self,
        request: u8,
        value: u16,
        index: u16,
        _timeout: Duration,
    ) -> Result<(), TransferError<Self::Error>> {
        if self.unplugged {
            return Err(TransferError::NoDevice);
        }
        self.controls.push((request, value, index));
        match request {
            CONTROL_CMD if value == 0 => {
                self.ep2.clear();
                self.ep3.clear();
                self.results.clear();
            }
            COMM_CMD => self.comm(value, index),
            _ => {}
        }
        Ok(())
    }

    fn bulk_write(
        &mut self,
        endpoint: u8,
        data: &[u8],
        _timeout: Duration,
    ) -> Result<usize, TransferError<Self::Error>> {
        assert_eq!(endpoint, EP_DATA_OUT);
        self.ep2.extend(data.iter().copied());
        Ok(data.len())
    }

    fn bulk_read(
        &mut self,
        endpoint: u8,
        buf: &mut [u8],
        _timeout: Duration,
    ) -> Result<usize, TransferError<Self::Error>> {
        assert_eq!(endpoint, EP_DATA_IN);
        if self.stall_reads > 0 {
            self.stall_reads -= 1;
            return Err(TransferError::Stall);
        }
        let n = buf.len().min(self.ep3.len());
        for b in buf.iter_mut().take(n) {
            *b = self.ep3.pop_front().unwrap_or(0);
        }
        Ok(n)
    }

    fn interrupt_read(
        &mut self,
        endpoint: u8,
        buf: &mut [u8],
        _timeout: Duration,
    ) -> Result<usize, TransferError<Self::Error>> {
        assert_eq!(endpoint, EP_STATUS);
        if self.unplugged {
            return Err(TransferError::NoDevice);
        }
        let mut packet = [0u8; STATUS_PACKET_MAX];
        packet[8] = if self.busy { 0x00 } else { 0x20 };
        packet[13] = self.ep3.len().min(0xff) as u8;
        let results = self.results.len().min(16);
        packet[16..16 + results].copy_from_slice(&self.results[..results]);
        self.results.clear();
        let n = (16 + results).min(buf.len());
        buf[..n].copy_from_slice(&packet[..n]);
        Ok(n)
    }

    fn clear_halt(&mut self, endpoint: u8) -> Result<(), TransferError<Self::Error>> {
        self.halts_cleared.push(endpoint);
        Ok(())
    }
}
