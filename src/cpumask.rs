// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Cpumask
//!
//! A bit-set of CPU ids used to describe frequency-domain membership.
//!
//! Unlike masks tied to the host topology, the id space is sized
//! explicitly by the caller; this core never inspects the machine it runs
//! on. Masks can be built empty, from a hexadecimal mask string, or from a
//! kernel-style cpulist ("0-3,8").

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use bitvec::prelude::*;
use sscanf::sscanf;
use std::fmt;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Cpumask {
    mask: BitVec<u64, Lsb0>,
}

impl Cpumask {
    fn check_cpu(&self, cpu: usize) -> Result<()> {
        if cpu >= self.mask.len() {
            bail!("invalid CPU {}, mask covers {} ids", cpu, self.mask.len());
        }
        Ok(())
    }

    /// Build an empty mask covering CPU ids `0..nr_cpu_ids`.
    pub fn new(nr_cpu_ids: usize) -> Cpumask {
        Cpumask {
            mask: bitvec![u64, Lsb0; 0; nr_cpu_ids],
        }
    }

    /// Build a mask from a hexadecimal string, e.g. "0xf0".
    pub fn from_str(cpumask: &str, nr_cpu_ids: usize) -> Result<Cpumask> {
        let hex_str = {
            let mut tmp_str = cpumask
                .strip_prefix("0x")
                .unwrap_or(cpumask)
                .replace('_', "");
            if tmp_str.len() % 2 != 0 {
                tmp_str = "0".to_string() + &tmp_str;
            }
            tmp_str
        };
        let byte_vec =
            hex::decode(&hex_str).with_context(|| format!("Failed to parse cpumask: {cpumask}"))?;

        let mut mask = Cpumask::new(nr_cpu_ids);
        for (index, &val) in byte_vec.iter().rev().enumerate() {
            let mut v = val;
            while v != 0 {
                let lsb = v.trailing_zeros() as usize;
                v &= !(1 << lsb);
                mask.set_cpu(index * 8 + lsb)
                    .with_context(|| format!("cpumask {cpumask} exceeds {nr_cpu_ids} CPU ids"))?;
            }
        }

        Ok(mask)
    }

    /// Build a mask from a cpulist, e.g. "0-2,5".
    pub fn from_cpulist(cpulist: &str, nr_cpu_ids: usize) -> Result<Cpumask> {
        let mut mask = Cpumask::new(nr_cpu_ids);
        for cpu_id in read_cpulist(cpulist)? {
            mask.set_cpu(cpu_id)?;
        }

        Ok(mask)
    }

    pub fn set_cpu(&mut self, cpu: usize) -> Result<()> {
        self.check_cpu(cpu)?;
        self.mask.set(cpu, true);
        Ok(())
    }

    pub fn clear_cpu(&mut self, cpu: usize) -> Result<()> {
        self.check_cpu(cpu)?;
        self.mask.set(cpu, false);
        Ok(())
    }

    /// Test whether the specified CPU bit is set. Ids beyond the mask
    /// report false.
    pub fn test_cpu(&self, cpu: usize) -> bool {
        match self.mask.get(cpu) {
            Some(bit) => *bit,
            None => false,
        }
    }

    /// Count the number of bits set.
    pub fn weight(&self) -> usize {
        self.mask.count_ones()
    }

    pub fn is_empty(&self) -> bool {
        self.mask.count_ones() == 0
    }

    /// The id space covered by the mask.
    pub fn len(&self) -> usize {
        self.mask.len()
    }

    /// AND of two masks over the same id space.
    pub fn and(&self, other: &Cpumask) -> Cpumask {
        let mut new = self.clone();
        new.mask &= other.mask.clone();
        new
    }

    /// Iterate over the set CPU ids in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.mask.iter_ones()
    }
}

pub fn read_cpulist(cpulist: &str) -> Result<Vec<usize>> {
    let cpulist = cpulist.trim_end_matches('\0');
    let cpu_groups: Vec<&str> = cpulist.split(',').collect();
    let mut cpu_ids = vec![];
    for group in cpu_groups.iter() {
        let (min, max) = match sscanf!(group.trim(), "{usize}-{usize}") {
            Ok((x, y)) => (x, y),
            Err(_) => match sscanf!(group.trim(), "{usize}") {
                Ok(x) => (x, x),
                Err(_) => {
                    bail!("Failed to parse cpulist {}", group.trim());
                }
            },
        };
        for i in min..(max + 1) {
            cpu_ids.push(i);
        }
    }

    Ok(cpu_ids)
}

impl fmt::Display for Cpumask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for word in self.mask.as_raw_slice().iter().rev() {
            if first {
                write!(f, "{word:x}")?;
                first = false;
            } else {
                write!(f, ",{word:016x}")?;
            }
        }
        if first {
            write!(f, "0")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_str_round_trip() {
        let mask = Cpumask::from_str("0xf0", 16).unwrap();
        assert_eq!(mask.weight(), 4);
        for cpu in 4..8 {
            assert!(mask.test_cpu(cpu));
        }
        assert!(!mask.test_cpu(0));
        assert_eq!(format!("{mask}"), "f0");
    }

    #[test]
    fn from_cpulist_ranges() {
        let mask = Cpumask::from_cpulist("0-2,5", 8).unwrap();
        assert_eq!(mask.iter().collect::<Vec<_>>(), vec![0, 1, 2, 5]);
    }

    #[test]
    fn out_of_range_rejected() {
        assert!(Cpumask::from_cpulist("0-8", 8).is_err());
        assert!(Cpumask::from_str("0x100", 8).is_err());

        let mut mask = Cpumask::new(4);
        assert!(mask.set_cpu(4).is_err());
        assert!(!mask.test_cpu(4));
    }

    #[test]
    fn and_masks() {
        let a = Cpumask::from_cpulist("0-3", 8).unwrap();
        let b = Cpumask::from_cpulist("2-5", 8).unwrap();
        let both = a.and(&b);
        assert_eq!(both.iter().collect::<Vec<_>>(), vec![2, 3]);
    }
}
