//! Gap filling and padding between output sections.

use crate::sections::SectionPlan;

/// Filler is appended in chunks of at most this many bytes per write.
const FILL_CHUNK: usize = 8192;

/// One pending filler run, applied after all real content is in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FillOp {
    /// Index into the plan list.
    pub(crate) plan: usize,
    /// Number of filler bytes to append.
    pub(crate) len: u64,
    pub(crate) byte: u8,
}

/// Order sections for layout: non-loadable and content-free sections
/// first, then by ascending load address, then by ascending size for
/// colliding addresses.
fn layout_order(plans: &[SectionPlan]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..plans.len()).collect();
    order.sort_by_key(|&index| {
        let plan = &plans[index];
        (plan.loadable && plan.has_contents, plan.lma, plan.size)
    });
    order
}

/// Compute the filler runs implied by the gap-fill byte and pad-to
/// address, growing the plan sizes to match.
///
/// The filler bytes themselves are written by [`apply`] as a final pass
/// so that the size changes cannot corrupt content already produced.
pub(crate) fn plan_fills(
    plans: &mut [SectionPlan],
    gap_fill: Option<u8>,
    pad_to: Option<u64>,
) -> Vec<FillOp> {
    let order = layout_order(plans);
    let mut fills = Vec::new();
    let loadable: Vec<usize> = order
        .iter()
        .copied()
        .filter(|&index| plans[index].loadable && plans[index].has_contents)
        .collect();

    if let Some(byte) = gap_fill {
        for pair in loadable.windows(2) {
            let (first, second) = (pair[0], pair[1]);
            let end = plans[first].lma + plans[first].size;
            let next = plans[second].lma;
            if end < next {
                let len = next - end;
                plans[first].size += len;
                fills.push(FillOp {
                    plan: first,
                    len,
                    byte,
                });
            }
        }
    }

    if let Some(target) = pad_to {
        if let Some(&last) = loadable.last() {
            let end = plans[last].lma + plans[last].size;
            if end < target {
                let len = target - end;
                plans[last].size += len;
                fills.push(FillOp {
                    plan: last,
                    len,
                    byte: gap_fill.unwrap_or(0),
                });
            }
        }
    }

    fills
}

/// Append the filler bytes recorded by [`plan_fills`].
pub(crate) fn apply(plans: &mut [SectionPlan], fills: &[FillOp]) {
    for fill in fills {
        let data = &mut plans[fill.plan].data;
        let mut remaining = fill.len as usize;
        while remaining > 0 {
            let chunk = remaining.min(FILL_CHUNK);
            data.resize(data.len() + chunk, fill.byte);
            remaining -= chunk;
        }
    }
}
