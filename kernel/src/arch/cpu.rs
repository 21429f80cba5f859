//! Boot-time CPU identification through CPUID.

#[cfg(target_arch = "x86")]
use core::arch::x86::__cpuid_count;
#[cfg(target_arch = "x86_64")]
use core::arch::x86_64::__cpuid_count;

use arrayvec::ArrayString;
use raw_cpuid::{CpuId, CpuIdResult};

/// What the kernel wants to know about the boot processor.
#[derive(Debug, Clone)]
pub struct CpuSummary {
    pub vendor: ArrayString<12>,
    pub has_apic: bool,
    pub has_pse: bool,
    pub logical_cores: u8,
}

// The kernel target is built without SSE, so the reader is supplied here
// instead of relying on the crate's native one.
fn read_cpuid(leaf: u32, subleaf: u32) -> CpuIdResult {
    #[allow(unused_unsafe)]
    let result = unsafe { __cpuid_count(leaf, subleaf) };
    CpuIdResult {
        eax: result.eax,
        ebx: result.ebx,
        ecx: result.ecx,
        edx: result.edx,
    }
}

/// Queries CPUID leaves 0 and 1.
pub fn probe() -> CpuSummary {
    let cpuid = CpuId::with_cpuid_reader(read_cpuid);

    let mut vendor = ArrayString::new();
    if let Some(info) = cpuid.get_vendor_info() {
        let _ = vendor.try_push_str(info.as_str());
    }

    let features = cpuid.get_feature_info();
    CpuSummary {
        vendor,
        has_apic: features.as_ref().is_some_and(|f| f.has_apic()),
        has_pse: features.as_ref().is_some_and(|f| f.has_pse()),
        logical_cores: features
            .as_ref()
            .map_or(1, |f| f.max_logical_processor_ids().max(1)),
    }
}

/// Logs the probe result. A missing APIC is only a warning, timer setup is
/// left to the interrupt layer.
pub fn log_summary(summary: &CpuSummary) {
    log::info!(
        "CPU vendor {}, {} logical core(s), PSE {}",
        summary.vendor.as_str(),
        summary.logical_cores,
        if summary.has_pse { "yes" } else { "no" }
    );
    if summary.has_apic {
        log::info!("APIC present");
    } else {
        log::warn!("APIC absent");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_reports_at_least_one_core() {
        let summary = probe();
        assert!(summary.logical_cores >= 1);
        assert!(summary.vendor.len() <= 12);
    }
}
