//! # FEC Codec — Systematic Cauchy Erasure Code over GF(2^8)
//!
//! Each code group of `k` originals is extended with `r` computed recovery
//! symbols. Recovery symbol `j` is the linear combination
//!
//! ```text
//!   recovery[j] = Σ_i  c(j, i) · original[i]      (GF(2^8) arithmetic)
//! ```
//!
//! with Cauchy coefficients `c(j, i) = 1 / ((k + j) ^ i)`. Every square
//! submatrix of a Cauchy matrix is nonsingular, so the systematic generator
//! `[I; C]` is MDS: any `k` of the `k + r` symbols reconstruct the group,
//! for every subset choice. The two index families stay disjoint as long as
//! `k + r <= 255`, which the group limits below guarantee.
//!
//! Field arithmetic uses the 0x11D polynomial with generator 2, via
//! log/exp tables built at compile time.
//!
//! All symbols in a group share one padded length: originals are framed as
//! `[len: u16 BE][payload][zeros]` before encoding so the decoder can
//! recover exact application lengths from reconstructed symbols.

use thiserror::Error;

/// Most originals a single code group may hold.
pub const GROUP_ORIGINAL_LIMIT: usize = 192;

/// Most recovery symbols a single code group may carry.
pub const GROUP_RECOVERY_LIMIT: usize = 63;

/// Length-prefix bytes prepended to each original in the code workspace.
pub const LENGTH_PREFIX_BYTES: usize = 2;

// ─── GF(2^8) Arithmetic ─────────────────────────────────────────────────────

/// Log/exp tables for GF(2^8) with polynomial 0x11D, generator 2.
/// The exp table is doubled so products index without a modulo.
struct Gf256 {
    log: [u8; 256],
    exp: [u8; 512],
}

impl Gf256 {
    const fn build() -> Self {
        let mut log = [0u8; 256];
        let mut exp = [0u8; 512];
        let mut x: u16 = 1;
        let mut i = 0;
        while i < 255 {
            exp[i] = x as u8;
            log[x as usize] = i as u8;
            x <<= 1;
            if x & 0x100 != 0 {
                x ^= 0x11D;
            }
            i += 1;
        }
        while i < 512 {
            exp[i] = exp[i - 255];
            i += 1;
        }
        Gf256 { log, exp }
    }
}

static GF: Gf256 = Gf256::build();

#[inline]
fn gf_mul(a: u8, b: u8) -> u8 {
    if a == 0 || b == 0 {
        0
    } else {
        GF.exp[GF.log[a as usize] as usize + GF.log[b as usize] as usize]
    }
}

#[inline]
fn gf_inv(a: u8) -> u8 {
    debug_assert_ne!(a, 0, "zero has no inverse");
    GF.exp[255 - GF.log[a as usize] as usize]
}

/// `dst ^= coeff * src`, elementwise.
fn gf_mul_acc(dst: &mut [u8], src: &[u8], coeff: u8) {
    debug_assert_eq!(dst.len(), src.len());
    match coeff {
        0 => {}
        1 => {
            for (d, s) in dst.iter_mut().zip(src) {
                *d ^= s;
            }
        }
        _ => {
            let lc = GF.log[coeff as usize] as usize;
            for (d, s) in dst.iter_mut().zip(src) {
                if *s != 0 {
                    *d ^= GF.exp[lc + GF.log[*s as usize] as usize];
                }
            }
        }
    }
}

/// `row *= coeff`, elementwise.
fn gf_scale(row: &mut [u8], coeff: u8) {
    if coeff == 1 {
        return;
    }
    for b in row.iter_mut() {
        *b = gf_mul(*b, coeff);
    }
}

/// Cauchy coefficient tying recovery symbol `j` to original `i` in a group
/// of `k` originals. Recovery indices live at `k..k+r` so the two index
/// sets never collide while `k + r <= 255`.
#[inline]
pub fn recovery_coefficient(original_count: usize, recovery_index: usize, original_index: usize) -> u8 {
    gf_inv(((original_count + recovery_index) as u8) ^ (original_index as u8))
}

// ─── Padding ────────────────────────────────────────────────────────────────

/// Frame `payload` as `[len][payload][zeros]` of exactly `padded_len` bytes,
/// appended to `out`.
pub fn write_padded(payload: &[u8], padded_len: usize, out: &mut Vec<u8>) {
    debug_assert!(payload.len() + LENGTH_PREFIX_BYTES <= padded_len);
    out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    out.extend_from_slice(payload);
    out.resize(out.len() + (padded_len - LENGTH_PREFIX_BYTES - payload.len()), 0);
}

/// Strip the length frame from a padded symbol. `None` if the prefix claims
/// more bytes than the symbol holds.
pub fn unpad(padded: &[u8]) -> Option<&[u8]> {
    if padded.len() < LENGTH_PREFIX_BYTES {
        return None;
    }
    let len = u16::from_be_bytes([padded[0], padded[1]]) as usize;
    padded.get(LENGTH_PREFIX_BYTES..LENGTH_PREFIX_BYTES + len)
}

// ─── Encoder ────────────────────────────────────────────────────────────────

/// Write recovery symbol `recovery_index` for the given padded originals
/// into `dst`. `dst` must be zeroed and exactly one padded length long.
pub fn encode_recovery_symbol<S: AsRef<[u8]>>(padded: &[S], recovery_index: usize, dst: &mut [u8]) {
    let k = padded.len();
    for (i, symbol) in padded.iter().enumerate() {
        gf_mul_acc(dst, symbol.as_ref(), recovery_coefficient(k, recovery_index, i));
    }
}

// ─── Decoder ────────────────────────────────────────────────────────────────

/// Reasons the erasure decoder can decline.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    /// Fewer recovery symbols than missing originals.
    #[error("{missing} originals missing but only {recovery} recovery symbols held")]
    NotEnoughSymbols { missing: usize, recovery: usize },

    /// Symbol lengths or indices do not agree with the group parameters.
    #[error("group parameters inconsistent across symbols")]
    Inconsistent,

    /// The equation system did not reduce (corrupt coefficients).
    #[error("recovery system is singular")]
    Singular,
}

/// Reconstruct the missing originals of a group.
///
/// * `original_count` — authoritative `k` for the group.
/// * `padded_len` — shared symbol length (from recovery symbols).
/// * `present` — received originals as `(id, raw unpadded payload)`.
/// * `recovery` — received recovery symbols as `(recovery index, padded chunk)`.
///
/// Returns the missing originals as `(id, padded symbol)` in ascending id
/// order. The caller strips the length frame with [`unpad`].
///
/// Solves only for the unknowns: each used recovery symbol is reduced by
/// the contributions of the originals that did arrive, leaving an
/// `m × m` Cauchy subsystem for the `m` missing symbols, then Gaussian
/// elimination with pivoting.
pub fn recover_missing(
    original_count: usize,
    padded_len: usize,
    present: &[(usize, &[u8])],
    recovery: &[(usize, &[u8])],
) -> Result<Vec<(usize, Vec<u8>)>, DecodeError> {
    let k = original_count;
    if k == 0 || k > GROUP_ORIGINAL_LIMIT || padded_len < LENGTH_PREFIX_BYTES {
        return Err(DecodeError::Inconsistent);
    }

    let mut have = vec![false; k];
    for &(id, payload) in present {
        if id >= k || payload.len() + LENGTH_PREFIX_BYTES > padded_len {
            return Err(DecodeError::Inconsistent);
        }
        have[id] = true;
    }
    let missing: Vec<usize> = (0..k).filter(|&i| !have[i]).collect();
    let m = missing.len();
    if m == 0 {
        return Ok(Vec::new());
    }
    if recovery.len() < m {
        return Err(DecodeError::NotEnoughSymbols {
            missing: m,
            recovery: recovery.len(),
        });
    }
    for &(j, chunk) in recovery {
        if k + j > 255 || chunk.len() != padded_len {
            return Err(DecodeError::Inconsistent);
        }
    }

    // Right-hand sides: the first m recovery chunks, minus what the
    // received originals contributed to them.
    let used = &recovery[..m];
    let mut rhs: Vec<Vec<u8>> = used.iter().map(|&(_, chunk)| chunk.to_vec()).collect();
    let mut padded_scratch = Vec::with_capacity(padded_len);
    for &(id, payload) in present {
        padded_scratch.clear();
        write_padded(payload, padded_len, &mut padded_scratch);
        for (row, &(j, _)) in used.iter().enumerate() {
            gf_mul_acc(&mut rhs[row], &padded_scratch, recovery_coefficient(k, j, id));
        }
    }

    // Coefficient matrix over the unknowns.
    let mut a: Vec<Vec<u8>> = used
        .iter()
        .map(|&(j, _)| {
            missing
                .iter()
                .map(|&col_id| recovery_coefficient(k, j, col_id))
                .collect()
        })
        .collect();

    for col in 0..m {
        let pivot = (col..m)
            .find(|&row| a[row][col] != 0)
            .ok_or(DecodeError::Singular)?;
        a.swap(col, pivot);
        rhs.swap(col, pivot);

        let inv = gf_inv(a[col][col]);
        gf_scale(&mut a[col], inv);
        gf_scale(&mut rhs[col], inv);

        // Clones sidestep the simultaneous row borrows during elimination.
        let pivot_coeffs = a[col].clone();
        let pivot_rhs = rhs[col].clone();
        for row in 0..m {
            if row == col {
                continue;
            }
            let factor = a[row][col];
            if factor == 0 {
                continue;
            }
            gf_mul_acc(&mut a[row], &pivot_coeffs, factor);
            gf_mul_acc(&mut rhs[row], &pivot_rhs, factor);
        }
    }

    Ok(missing.into_iter().zip(rhs).collect())
}
