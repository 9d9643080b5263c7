//! Native sampler chain.
//!
//! Stages transform a candidate list built from the logits of one output
//! row. Filtering stages shrink or reweight it; the first selecting stage
//! (greedy, dist, mirostat) picks the token and ends the pass.

use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};

use anyhow::{anyhow, bail, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::engine::{resolve_seed, Context, Model, SamplerChain, SamplerStage, Token};

/// Upper bound on the penalty window when `last_n` asks for "everything".
const MAX_PENALTY_WINDOW: usize = 4096;

#[derive(Debug, Clone, Copy)]
struct Candidate {
    id: Token,
    logit: f32,
    p: f32,
}

#[derive(Debug, Default)]
struct Candidates {
    items: Vec<Candidate>,
    sorted: bool,
}

impl Candidates {
    fn from_logits(logits: &[f32]) -> Self {
        Self {
            items: logits
                .iter()
                .enumerate()
                .map(|(i, &logit)| Candidate {
                    id: i as Token,
                    logit,
                    p: 0.0,
                })
                .collect(),
            sorted: false,
        }
    }

    fn sort(&mut self) {
        if !self.sorted {
            self.items
                .sort_by(|a, b| b.logit.partial_cmp(&a.logit).unwrap_or(Ordering::Equal));
            self.sorted = true;
        }
    }

    /// Sorts by logit and fills in normalised probabilities.
    fn softmax(&mut self) {
        self.sort();
        let Some(max) = self.items.first().map(|c| c.logit) else {
            return;
        };
        let mut sum = 0.0;
        for c in &mut self.items {
            c.p = (c.logit - max).exp();
            sum += c.p;
        }
        if sum > 0.0 {
            for c in &mut self.items {
                c.p /= sum;
            }
        }
    }

    fn truncate(&mut self, n: usize) {
        self.items.truncate(n.max(1));
    }

    fn len(&self) -> usize {
        self.items.len()
    }

    fn argmax(&self) -> Option<Token> {
        self.items
            .iter()
            .max_by(|a, b| a.logit.partial_cmp(&b.logit).unwrap_or(Ordering::Equal))
            .map(|c| c.id)
    }

    /// Draws from the probabilities computed by the last `softmax`.
    fn draw(&self, rng: &mut StdRng) -> Option<Token> {
        let total: f32 = self.items.iter().map(|c| c.p).sum();
        let mut target = rng.random::<f32>() * total;
        for c in &self.items {
            if target < c.p {
                return Some(c.id);
            }
            target -= c.p;
        }
        self.items.last().map(|c| c.id)
    }

    fn entropy(&self) -> f32 {
        self.items
            .iter()
            .filter(|c| c.p > 0.0)
            .map(|c| -c.p * c.p.ln())
            .sum()
    }
}

#[derive(Debug)]
enum Stage {
    Greedy,
    Dist {
        seed: u64,
        rng: StdRng,
    },
    TopK {
        k: i32,
    },
    TopP {
        p: f32,
        min_keep: usize,
    },
    MinP {
        p: f32,
        min_keep: usize,
    },
    Typical {
        p: f32,
        min_keep: usize,
    },
    Temp {
        t: f32,
    },
    TempExt {
        t: f32,
        delta: f32,
        exponent: f32,
    },
    Xtc {
        p: f32,
        t: f32,
        min_keep: usize,
        seed: u64,
        rng: StdRng,
    },
    TopNSigma {
        n: f32,
    },
    Mirostat {
        seed: u64,
        rng: StdRng,
        n_vocab: usize,
        tau: f32,
        eta: f32,
        m: usize,
        mu: f32,
    },
    MirostatV2 {
        seed: u64,
        rng: StdRng,
        tau: f32,
        eta: f32,
        mu: f32,
    },
    Penalties {
        window: usize,
        repeat: f32,
        freq: f32,
        present: f32,
        history: VecDeque<Token>,
    },
}

impl Stage {
    fn build(stage: &SamplerStage, model: Option<&dyn Model>) -> Result<Self> {
        Ok(match *stage {
            SamplerStage::Greedy => Stage::Greedy,
            SamplerStage::Dist { seed } => {
                let seed = resolve_seed(seed);
                Stage::Dist {
                    seed,
                    rng: StdRng::seed_from_u64(seed),
                }
            }
            SamplerStage::TopK { k } => Stage::TopK { k },
            SamplerStage::TopP { p, min_keep } => Stage::TopP { p, min_keep },
            SamplerStage::MinP { p, min_keep } => Stage::MinP { p, min_keep },
            SamplerStage::Typical { p, min_keep } => Stage::Typical { p, min_keep },
            SamplerStage::Temp { t } => Stage::Temp { t },
            SamplerStage::TempExt { t, delta, exponent } => Stage::TempExt { t, delta, exponent },
            SamplerStage::Xtc {
                p,
                t,
                min_keep,
                seed,
            } => {
                let seed = resolve_seed(seed);
                Stage::Xtc {
                    p,
                    t,
                    min_keep,
                    seed,
                    rng: StdRng::seed_from_u64(seed),
                }
            }
            SamplerStage::TopNSigma { n } => Stage::TopNSigma { n },
            SamplerStage::Mirostat { seed, tau, eta, m } => {
                let model = model.ok_or_else(|| anyhow!("mirostat needs the model vocabulary"))?;
                let seed = resolve_seed(seed);
                Stage::Mirostat {
                    seed,
                    rng: StdRng::seed_from_u64(seed),
                    n_vocab: model.info().n_vocab.max(1) as usize,
                    tau,
                    eta,
                    m: m.max(1) as usize,
                    mu: 2.0 * tau,
                }
            }
            SamplerStage::MirostatV2 { seed, tau, eta } => {
                let seed = resolve_seed(seed);
                Stage::MirostatV2 {
                    seed,
                    rng: StdRng::seed_from_u64(seed),
                    tau,
                    eta,
                    mu: 2.0 * tau,
                }
            }
            SamplerStage::Penalties {
                last_n,
                repeat,
                freq,
                present,
            } => Stage::Penalties {
                window: match last_n {
                    n if n < 0 => MAX_PENALTY_WINDOW,
                    n => n as usize,
                },
                repeat,
                freq,
                present,
                history: VecDeque::new(),
            },
            SamplerStage::Grammar { .. } | SamplerStage::Infill => {
                bail!("{} sampling is not supported by this engine", stage.name())
            }
        })
    }

    /// Applies the stage; selecting stages return the chosen token.
    fn apply(&mut self, cands: &mut Candidates) -> Option<Token> {
        match self {
            Stage::Greedy => return cands.argmax(),
            Stage::Dist { rng, .. } => {
                cands.softmax();
                return cands.draw(rng);
            }
            Stage::TopK { k } => {
                if *k > 0 && (*k as usize) < cands.len() {
                    cands.sort();
                    cands.truncate(*k as usize);
                }
            }
            Stage::TopP { p, min_keep } => {
                if *p < 1.0 {
                    cands.softmax();
                    let mut cum = 0.0;
                    let mut keep = cands.len();
                    for (i, c) in cands.items.iter().enumerate() {
                        cum += c.p;
                        if cum >= *p && i + 1 >= *min_keep {
                            keep = i + 1;
                            break;
                        }
                    }
                    cands.truncate(keep);
                }
            }
            Stage::MinP { p, min_keep } => {
                if *p > 0.0 && cands.len() > 0 {
                    cands.softmax();
                    let threshold = cands.items[0].p * *p;
                    let keep = cands
                        .items
                        .iter()
                        .position(|c| c.p < threshold)
                        .unwrap_or(cands.len())
                        .max(*min_keep);
                    cands.truncate(keep);
                }
            }
            Stage::Typical { p, min_keep } => {
                if *p < 1.0 && cands.len() > 1 {
                    cands.softmax();
                    let entropy = cands.entropy();
                    let mut order: Vec<(f32, Candidate)> = cands
                        .items
                        .iter()
                        .map(|c| ((-c.p.ln() - entropy).abs(), *c))
                        .collect();
                    order.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(Ordering::Equal));
                    let mut cum = 0.0;
                    let mut keep = order.len();
                    for (i, (_, c)) in order.iter().enumerate() {
                        cum += c.p;
                        if cum > *p && i + 1 >= *min_keep {
                            keep = i + 1;
                            break;
                        }
                    }
                    cands.items = order.into_iter().take(keep.max(1)).map(|(_, c)| c).collect();
                    cands.sorted = false;
                }
            }
            Stage::Temp { t } => temperature(cands, *t),
            Stage::TempExt { t, delta, exponent } => {
                if *delta > 0.0 && cands.len() > 1 {
                    let min_t = (*t - *delta).max(0.0);
                    let max_t = *t + *delta;
                    cands.softmax();
                    let max_entropy = (cands.len() as f32).ln();
                    let normalized = cands.entropy() / max_entropy;
                    let dyn_t = min_t + (max_t - min_t) * normalized.powf(*exponent);
                    temperature(cands, dyn_t);
                } else {
                    temperature(cands, *t);
                }
            }
            Stage::Xtc {
                p, t, min_keep, rng, ..
            } => {
                if *p > 0.0 && *t <= 0.5 && cands.len() >= 2 && rng.random::<f32>() <= *p {
                    cands.softmax();
                    let above = cands.items.iter().take_while(|c| c.p >= *t).count();
                    if above >= 2 && cands.len() - (above - 1) >= *min_keep {
                        cands.items.drain(..above - 1);
                    }
                }
            }
            Stage::TopNSigma { n } => {
                if *n > 0.0 && cands.len() > 1 {
                    let finite: Vec<f32> = cands
                        .items
                        .iter()
                        .map(|c| c.logit)
                        .filter(|l| l.is_finite())
                        .collect();
                    if !finite.is_empty() {
                        let max = finite.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
                        let mean = finite.iter().sum::<f32>() / finite.len() as f32;
                        let var = finite.iter().map(|l| (l - mean).powi(2)).sum::<f32>()
                            / finite.len() as f32;
                        let cutoff = max - *n * var.sqrt();
                        cands.items.retain(|c| c.logit >= cutoff);
                    }
                }
            }
            Stage::Mirostat {
                rng,
                n_vocab,
                tau,
                eta,
                m,
                mu,
                ..
            } => {
                cands.softmax();
                let limit = (*m).min(cands.len()).saturating_sub(1);
                let (mut sum_ti_bi, mut sum_ti_sq) = (0.0f32, 0.0f32);
                for i in 0..limit {
                    let t_i = ((i + 2) as f32 / (i + 1) as f32).ln();
                    let b_i = (cands.items[i].p / cands.items[i + 1].p).ln();
                    sum_ti_bi += t_i * b_i;
                    sum_ti_sq += t_i * t_i;
                }
                let s_hat = if sum_ti_sq > 0.0 {
                    sum_ti_bi / sum_ti_sq
                } else {
                    1.0
                };
                let epsilon_hat = s_hat - 1.0;
                let k = ((epsilon_hat * 2f32.powf(*mu))
                    / (1.0 - (*n_vocab as f32).powf(-epsilon_hat)))
                .powf(1.0 / s_hat);
                let k = if k.is_finite() { k.max(1.0) as usize } else { 1 };
                cands.truncate(k);
                cands.softmax();
                let token = cands.draw(rng)?;
                update_mu(cands, token, mu, *tau, *eta);
                return Some(token);
            }
            Stage::MirostatV2 {
                rng, tau, eta, mu, ..
            } => {
                cands.softmax();
                let keep = cands
                    .items
                    .iter()
                    .position(|c| -c.p.log2() > *mu)
                    .unwrap_or(cands.len());
                cands.truncate(keep);
                cands.softmax();
                let token = cands.draw(rng)?;
                update_mu(cands, token, mu, *tau, *eta);
                return Some(token);
            }
            Stage::Penalties {
                window,
                repeat,
                freq,
                present,
                history,
            } => {
                let inactive = *window == 0 || (*repeat == 1.0 && *freq == 0.0 && *present == 0.0);
                if !inactive && !history.is_empty() {
                    let mut counts: HashMap<Token, usize> = HashMap::new();
                    for &t in history.iter() {
                        *counts.entry(t).or_default() += 1;
                    }
                    for c in &mut cands.items {
                        let Some(&count) = counts.get(&c.id) else {
                            continue;
                        };
                        if c.logit <= 0.0 {
                            c.logit *= *repeat;
                        } else {
                            c.logit /= *repeat;
                        }
                        c.logit -= count as f32 * *freq + *present;
                    }
                    cands.sorted = false;
                }
            }
        }
        None
    }

    fn accept(&mut self, token: Token) {
        if let Stage::Penalties {
            window, history, ..
        } = self
        {
            if *window == 0 {
                return;
            }
            history.push_back(token);
            while history.len() > *window {
                history.pop_front();
            }
        }
    }

    fn reset(&mut self) {
        match self {
            Stage::Dist { seed, rng }
            | Stage::Xtc { seed, rng, .. }
            | Stage::Mirostat { seed, rng, .. }
            | Stage::MirostatV2 { seed, rng, .. } => *rng = StdRng::seed_from_u64(*seed),
            Stage::Penalties { history, .. } => history.clear(),
            _ => {}
        }
        match self {
            Stage::Mirostat { tau, mu, .. } | Stage::MirostatV2 { tau, mu, .. } => {
                *mu = 2.0 * *tau
            }
            _ => {}
        }
    }
}

fn temperature(cands: &mut Candidates, t: f32) {
    if t <= 0.0 {
        cands.sort();
        cands.truncate(1);
        return;
    }
    for c in &mut cands.items {
        c.logit /= t;
    }
}

fn update_mu(cands: &Candidates, token: Token, mu: &mut f32, tau: f32, eta: f32) {
    if let Some(c) = cands.items.iter().find(|c| c.id == token) {
        let surprise = -c.p.log2();
        *mu -= eta * (surprise - tau);
    }
}

#[derive(Debug, Default)]
pub struct NativeSamplerChain {
    stages: Vec<Stage>,
}

impl NativeSamplerChain {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SamplerChain for NativeSamplerChain {
    fn add(&mut self, stage: &SamplerStage, model: Option<&dyn Model>) -> Result<()> {
        self.stages.push(Stage::build(stage, model)?);
        Ok(())
    }

    fn sample(&mut self, ctx: &dyn Context, idx: i32) -> Result<Token> {
        let logits = ctx
            .logits_ith(idx)
            .ok_or_else(|| anyhow!("no logits for output {}", idx))?;
        let mut cands = Candidates::from_logits(logits);

        let mut selected = None;
        for stage in &mut self.stages {
            if let Some(token) = stage.apply(&mut cands) {
                selected = Some(token);
                break;
            }
        }
        let token = selected.ok_or_else(|| anyhow!("sampler chain did not select a token"))?;

        for stage in &mut self.stages {
            stage.accept(token);
        }
        Ok(token)
    }

    fn reset(&mut self) {
        for stage in &mut self.stages {
            stage.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::mock::{MockBackend, MockConfig};
    use crate::engine::{Backend, ContextParams, ModelParams};
    use crate::log::EngineLogger;

    fn cands(logits: &[f32]) -> Candidates {
        Candidates::from_logits(logits)
    }

    fn run(stages: &[SamplerStage], logits: &[f32]) -> Token {
        let mut built: Vec<Stage> = stages.iter().map(|s| Stage::build(s, None).unwrap()).collect();
        let mut c = cands(logits);
        for stage in &mut built {
            if let Some(t) = stage.apply(&mut c) {
                return t;
            }
        }
        panic!("no selecting stage");
    }

    #[test]
    fn reset_replays_the_seeded_sequence() {
        let mut stage = Stage::build(&SamplerStage::Dist { seed: 7 }, None).unwrap();
        let logits = [1.0, 1.2, 0.8, 1.1, 0.9];
        let draw = |stage: &mut Stage| stage.apply(&mut cands(&logits)).unwrap();
        let first: Vec<Token> = (0..8).map(|_| draw(&mut stage)).collect();
        stage.reset();
        let again: Vec<Token> = (0..8).map(|_| draw(&mut stage)).collect();
        assert_eq!(first, again);
    }

    #[test]
    fn greedy_takes_the_largest_logit() {
        assert_eq!(run(&[SamplerStage::Greedy], &[0.1, 2.0, 1.5]), 1);
    }

    #[test]
    fn top_k_one_then_dist_is_greedy() {
        let stages = [SamplerStage::TopK { k: 1 }, SamplerStage::Dist { seed: 3 }];
        assert_eq!(run(&stages, &[0.5, -1.0, 3.0, 2.9]), 2);
    }

    #[test]
    fn zero_temperature_keeps_only_the_best() {
        let mut c = cands(&[1.0, 4.0, 2.0]);
        temperature(&mut c, 0.0);
        assert_eq!(c.len(), 1);
        assert_eq!(c.items[0].id, 1);
    }

    #[test]
    fn seeded_dist_is_reproducible() {
        let logits = [1.0, 1.1, 0.9, 1.05];
        let a: Vec<Token> = (0..5)
            .map(|_| run(&[SamplerStage::Dist { seed: 11 }], &logits))
            .collect();
        let b: Vec<Token> = (0..5)
            .map(|_| run(&[SamplerStage::Dist { seed: 11 }], &logits))
            .collect();
        assert_eq!(a, b);
    }

    #[test]
    fn top_p_keeps_the_nucleus() {
        let mut stage = Stage::build(&SamplerStage::TopP { p: 0.5, min_keep: 1 }, None).unwrap();
        let mut c = cands(&[5.0, 0.0, 0.0, 0.0]);
        stage.apply(&mut c);
        assert_eq!(c.len(), 1);
    }

    #[test]
    fn min_p_drops_unlikely_tokens() {
        let mut stage = Stage::build(&SamplerStage::MinP { p: 0.5, min_keep: 1 }, None).unwrap();
        let mut c = cands(&[3.0, 2.9, -4.0]);
        stage.apply(&mut c);
        let ids: Vec<Token> = c.items.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![0, 1]);
    }

    #[test]
    fn penalties_discourage_repeats() {
        let mut stage = Stage::build(
            &SamplerStage::Penalties {
                last_n: 8,
                repeat: 1.0,
                freq: 0.0,
                present: 5.0,
            },
            None,
        )
        .unwrap();
        stage.accept(0);
        let mut c = cands(&[3.0, 2.0]);
        stage.apply(&mut c);
        assert_eq!(c.argmax(), Some(1));
        stage.reset();
        let mut c = cands(&[3.0, 2.0]);
        stage.apply(&mut c);
        assert_eq!(c.argmax(), Some(0));
    }

    #[test]
    fn mirostat_v2_selects_the_dominant_token() {
        let stage = SamplerStage::MirostatV2 {
            seed: 1,
            tau: 0.1,
            eta: 0.1,
        };
        assert_eq!(run(&[stage], &[0.0, 20.0, 0.0]), 1);
    }

    #[test]
    fn unsupported_stages_are_rejected() {
        let grammar = SamplerStage::Grammar {
            grammar: "root ::= \"a\"".into(),
            root: "root".into(),
        };
        assert!(Stage::build(&grammar, None).is_err());
        assert!(Stage::build(&SamplerStage::Infill, None).is_err());
    }

    #[test]
    fn chain_samples_from_a_context() {
        let backend = MockBackend::with_config(MockConfig {
            reply: "z".to_string(),
            ..MockConfig::default()
        });
        let model = backend
            .load_model("mock://s", &ModelParams::default(), EngineLogger::detached())
            .unwrap();
        let mut ctx = model
            .new_context(&ContextParams::default(), EngineLogger::detached())
            .unwrap();
        let batch = crate::engine::Batch::sequence(&[1, 50], 0, 0, true).unwrap();
        ctx.decode(&batch).unwrap();

        let mut chain = NativeSamplerChain::new();
        chain.add(&SamplerStage::TopK { k: 5 }, None).unwrap();
        chain.add(&SamplerStage::Greedy, None).unwrap();
        let token = chain.sample(ctx.as_ref(), -1).unwrap();
        assert_eq!(token, crate::engine::mock::byte_token(b'z'));
    }
}
