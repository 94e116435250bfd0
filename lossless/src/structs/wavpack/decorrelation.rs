//! Decorrelation passes: sign-sign LMS predictors applied in reverse of
//! the order they were stored.

use anyhow::{Result, bail};

use super::{exp2s, log_words, restore_weight};
use crate::utils::errors::WavPackError;

/// Maximum passes a block may declare.
pub const MAX_TERMS: usize = 16;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecorrelationPass {
    /// 1..=8 lag, 17/18 slope predictors, -1..=-3 cross-channel.
    pub term: i32,
    pub delta: i32,
    pub weight_a: i32,
    pub weight_b: i32,
    pub samples_a: [i32; 8],
    pub samples_b: [i32; 8],
}

fn apply_weight(weight: i32, sample: i32) -> i32 {
    ((weight as i64 * sample as i64 + 512) >> 10) as i32
}

/// Steps `weight` toward agreement between `sample` and `input` signs.
fn update_weight(weight: &mut i32, delta: i32, sample: i32, input: i32) {
    if sample != 0 && input != 0 {
        if (sample ^ input) < 0 {
            *weight -= delta;
        } else {
            *weight += delta;
        }
    }
}

/// [`update_weight`] limited to ±1024, used by the cross-channel terms.
fn update_weight_clip(weight: &mut i32, delta: i32, sample: i32, input: i32) {
    if sample != 0 && input != 0 {
        if (sample ^ input) < 0 {
            *weight = (*weight - delta).max(-1024);
        } else {
            *weight = (*weight + delta).min(1024);
        }
    }
}

/// Parses the terms sub-block: one byte per pass, `term + 5` in the low five
/// bits and the weight delta in the high three.
pub fn read_terms(data: &[u8], stereo: bool) -> Result<Vec<DecorrelationPass>> {
    if data.len() > MAX_TERMS {
        bail!(WavPackError::ExcessiveDecorrelationData {
            what: "terms",
            found: data.len(),
            max: MAX_TERMS,
        });
    }

    data.iter()
        .map(|&byte| {
            let term = (byte & 0x1F) as i32 - 5;
            let valid = match term {
                1..=8 | 17 | 18 => true,
                -3..=-1 => stereo,
                _ => false,
            };
            if !valid {
                bail!(WavPackError::InvalidDecorrelationTerm(term));
            }

            Ok(DecorrelationPass {
                term,
                delta: (byte >> 5) as i32,
                ..Default::default()
            })
        })
        .collect()
}

/// Parses the weights sub-block. Passes beyond the stored weights keep a
/// zero weight.
pub fn read_weights(passes: &mut [DecorrelationPass], data: &[u8], stereo: bool) -> Result<()> {
    let per_pass = if stereo { 2 } else { 1 };
    if data.len() > passes.len() * per_pass {
        bail!(WavPackError::ExcessiveDecorrelationData {
            what: "weights",
            found: data.len() / per_pass,
            max: passes.len(),
        });
    }

    for (pass, weights) in passes.iter_mut().zip(data.chunks_exact(per_pass)) {
        pass.weight_a = restore_weight(weights[0] as i8);
        if stereo {
            pass.weight_b = restore_weight(weights[1] as i8);
        }
    }

    Ok(())
}

/// Parses the history-samples sub-block. Storage per pass depends on the
/// term; the data may end before every pass is covered.
pub fn read_samples(passes: &mut [DecorrelationPass], data: &[u8], stereo: bool) -> Result<()> {
    let mut words = log_words(data);
    let mut consumed = 0;

    for pass in passes.iter_mut() {
        if consumed * 2 >= data.len() {
            break;
        }

        let count = match pass.term {
            17 | 18 => 2,
            term if term < 0 => 1,
            term => term as usize,
        };
        let needed = if stereo || pass.term < 0 { count * 2 } else { count };
        if (consumed + needed) * 2 > data.len() {
            bail!(WavPackError::ExcessiveDecorrelationData {
                what: "samples",
                found: data.len() / 2,
                max: consumed + needed,
            });
        }
        consumed += needed;

        let mut next = || words.next().map_or(0, exp2s);
        if pass.term > 8 {
            pass.samples_a[0] = next();
            pass.samples_a[1] = next();
            if stereo {
                pass.samples_b[0] = next();
                pass.samples_b[1] = next();
            }
        } else if pass.term < 0 {
            pass.samples_a[0] = next();
            pass.samples_b[0] = next();
        } else {
            for i in 0..count {
                pass.samples_a[i] = next();
                if stereo {
                    pass.samples_b[i] = next();
                }
            }
        }
    }

    Ok(())
}

impl DecorrelationPass {
    /// Prediction from the two most recent samples for terms 17 and 18.
    fn slope(term: i32, samples: &mut [i32; 8]) -> i32 {
        let predicted = if term & 1 == 1 {
            samples[0].wrapping_mul(2).wrapping_sub(samples[1])
        } else {
            samples[0].wrapping_mul(3).wrapping_sub(samples[1]) >> 1
        };
        samples[1] = samples[0];
        predicted
    }

    /// Undoes this pass for one mono residual. `position` counts samples in
    /// the block modulo 8.
    pub fn mono(&mut self, residual: i32, position: usize) -> i32 {
        let (predictor, slot) = if self.term > 8 {
            (Self::slope(self.term, &mut self.samples_a), 0)
        } else {
            (
                self.samples_a[position],
                (position + self.term as usize) & 7,
            )
        };

        let sample = residual.wrapping_add(apply_weight(self.weight_a, predictor));
        update_weight(&mut self.weight_a, self.delta, predictor, residual);
        self.samples_a[slot] = sample;
        sample
    }

    /// Undoes this pass for one pair of residuals.
    pub fn stereo(&mut self, left: i32, right: i32, position: usize) -> (i32, i32) {
        match self.term {
            term if term > 0 => {
                let (a, b, slot) = if term > 8 {
                    (
                        Self::slope(term, &mut self.samples_a),
                        Self::slope(term, &mut self.samples_b),
                        0,
                    )
                } else {
                    (
                        self.samples_a[position],
                        self.samples_b[position],
                        (position + term as usize) & 7,
                    )
                };

                let out_left = left.wrapping_add(apply_weight(self.weight_a, a));
                let out_right = right.wrapping_add(apply_weight(self.weight_b, b));
                update_weight(&mut self.weight_a, self.delta, a, left);
                update_weight(&mut self.weight_b, self.delta, b, right);
                self.samples_a[slot] = out_left;
                self.samples_b[slot] = out_right;
                (out_left, out_right)
            }
            -1 => {
                let out_left = left.wrapping_add(apply_weight(self.weight_a, self.samples_a[0]));
                update_weight_clip(&mut self.weight_a, self.delta, self.samples_a[0], left);
                let out_right = right.wrapping_add(apply_weight(self.weight_b, out_left));
                update_weight_clip(&mut self.weight_b, self.delta, out_left, right);
                self.samples_a[0] = out_right;
                (out_left, out_right)
            }
            term => {
                let out_right = right.wrapping_add(apply_weight(self.weight_b, self.samples_b[0]));
                update_weight_clip(&mut self.weight_b, self.delta, self.samples_b[0], right);

                // -3 predicts left from the previous right, -2 from the current one
                let predictor = if term == -3 {
                    std::mem::replace(&mut self.samples_a[0], out_right)
                } else {
                    out_right
                };
                let out_left = left.wrapping_add(apply_weight(self.weight_a, predictor));
                update_weight_clip(&mut self.weight_a, self.delta, predictor, left);
                self.samples_b[0] = out_left;
                (out_left, out_right)
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Forward transform of a single mono pass with a positive term.
    pub fn encode_mono(pass: &DecorrelationPass, samples: &[i32]) -> Vec<i32> {
        let mut pass = pass.clone();
        samples
            .iter()
            .enumerate()
            .map(|(i, &sample)| {
                let position = i & 7;
                let (predictor, slot) = if pass.term > 8 {
                    (DecorrelationPass::slope(pass.term, &mut pass.samples_a), 0)
                } else {
                    (pass.samples_a[position], (position + pass.term as usize) & 7)
                };
                let residual = sample.wrapping_sub(apply_weight(pass.weight_a, predictor));
                update_weight(&mut pass.weight_a, pass.delta, predictor, residual);
                pass.samples_a[slot] = sample;
                residual
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::testing::encode_mono;
    use super::*;

    fn pass(term: i32, delta: i32, weight: i32) -> DecorrelationPass {
        DecorrelationPass {
            term,
            delta,
            weight_a: weight,
            weight_b: weight,
            ..Default::default()
        }
    }

    #[test]
    fn terms_are_validated_for_both_layouts() {
        for term in [0, 9, 16, 19, 26, -4] {
            let byte = (term + 5) as u8;
            for stereo in [false, true] {
                let err = read_terms(&[byte], stereo).unwrap_err();
                assert!(matches!(
                    err.downcast_ref::<WavPackError>(),
                    Some(WavPackError::InvalidDecorrelationTerm(t)) if *t == term
                ));
            }
        }

        let err = read_terms(&[4], false).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<WavPackError>(),
            Some(WavPackError::InvalidDecorrelationTerm(-1))
        ));
    }

    #[test]
    fn terms_weights_and_samples() -> anyhow::Result<()> {
        // term 2 delta 2, term 17 delta 0, term -1 delta 7
        let mut passes = read_terms(&[7 | (2 << 5), 22, 4 | (7 << 5)], true)?;
        assert_eq!(
            passes.iter().map(|p| (p.term, p.delta)).collect::<Vec<_>>(),
            [(2, 2), (17, 0), (-1, 7)]
        );

        read_weights(&mut passes, &[127, 0x80, 64, 0], true)?;
        assert_eq!((passes[0].weight_a, passes[0].weight_b), (1024, -1024));
        assert_eq!((passes[1].weight_a, passes[1].weight_b), (516, 0));
        assert_eq!((passes[2].weight_a, passes[2].weight_b), (0, 0));

        // 0x0900 expands to 256; term 2 stores a0 b0 a1 b1
        let word = |v: i16| v.to_le_bytes();
        let data: Vec<u8> = [0x0900i16, 0x0100, -0x0900, 0]
            .into_iter()
            .flat_map(word)
            .collect();
        read_samples(&mut passes, &data, true)?;
        assert_eq!(&passes[0].samples_a[..2], [256, -256]);
        assert_eq!(&passes[0].samples_b[..2], [1, 0]);
        assert_eq!(passes[1].samples_a, [0; 8]);
        Ok(())
    }

    #[test]
    fn truncated_samples_are_rejected() -> anyhow::Result<()> {
        let mut passes = read_terms(&[22], false)?;
        let err = read_samples(&mut passes, &[0, 9], false).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<WavPackError>(),
            Some(WavPackError::ExcessiveDecorrelationData { what: "samples", .. })
        ));
        Ok(())
    }

    #[test]
    fn lag_one_adapts_weight() {
        let mut p = pass(1, 2, 512);
        let out: Vec<i32> = [100, 10, -4]
            .iter()
            .enumerate()
            .map(|(i, &r)| p.mono(r, i & 7))
            .collect();
        assert_eq!(out, [100, 60, 26]);
        assert_eq!(p.weight_a, 512);
    }

    #[test]
    fn slope_predictor() {
        let mut p = pass(17, 0, 1024);
        p.samples_a[0] = 10;
        p.samples_a[1] = 4;
        assert_eq!(p.mono(0, 0), 16);
        assert_eq!(p.mono(1, 1), 23);
    }

    #[test]
    fn cross_channel_terms() {
        let mut p = pass(-1, 0, 1024);
        assert_eq!(p.stereo(5, 3, 0), (5, 8));
        assert_eq!(p.stereo(1, 1, 1), (9, 10));

        // -2: right first from its history, then left from the new right
        let mut p = pass(-2, 0, 1024);
        p.samples_b[0] = 4;
        assert_eq!(p.stereo(1, 2, 0), (7, 6));
        assert_eq!(p.samples_b[0], 7);

        // -3: left is predicted from the previous right
        let mut p = pass(-3, 0, 1024);
        p.samples_a[0] = 10;
        assert_eq!(p.stereo(1, 2, 0), (11, 2));
        assert_eq!(p.samples_a[0], 2);
    }

    #[test]
    fn weights_clip_on_cross_terms() {
        let mut p = pass(-1, 7, 1020);
        p.samples_a[0] = 3;
        p.stereo(1, 1, 0);
        assert_eq!(p.weight_a, 1024);
        assert_eq!(p.weight_b, 1024);
    }

    #[test]
    fn forward_and_inverse_agree() {
        let samples = [3, -700, 1200, 55, 55, -9000, 32767, -32768, 0, 1, 2, 3];
        for (term, delta, weight) in [(1, 2, 300), (3, 5, -200), (8, 1, 900), (18, 3, 400)] {
            let template = pass(term, delta, weight);
            let residuals = encode_mono(&template, &samples);
            let mut p = template.clone();
            let decoded: Vec<i32> = residuals
                .iter()
                .enumerate()
                .map(|(i, &r)| p.mono(r, i & 7))
                .collect();
            assert_eq!(decoded, samples, "term {term}");
        }
    }
}
