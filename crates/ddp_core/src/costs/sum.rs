use std::sync::Arc;

use nalgebra::DVector;

use super::{check_inputs, CostData, CostModel};
use crate::error::{check_dim, Error, Result};
use crate::multibody::MultibodyData;
use crate::traits::StateSpace;

struct CostItem {
    name: String,
    cost: Box<dyn CostModel>,
    weight: f64,
}

/// `Σ wᵢ · costᵢ`, evaluated in registration order so floating-point accumulation is
/// reproducible.
///
/// The stacked term residuals form the sum's residual; its activation data holds
/// the stacked term activations scaled by their weights, which makes the
/// Gauss-Newton product `Rxᵀ·diag(Arr)·Rx` equal to the weighted sum of the terms.
pub struct CostSum {
    state: Arc<dyn StateSpace>,
    nu: usize,
    items: Vec<CostItem>,
}

fn validate_weight(weight: f64) -> Result<()> {
    if weight >= 0.0 && weight.is_finite() {
        Ok(())
    } else {
        Err(Error::InvalidArgument(format!(
            "cost weight must be finite and non-negative, got {weight}"
        )))
    }
}

impl CostSum {
    pub fn new(state: Arc<dyn StateSpace>, nu: usize) -> Self {
        Self {
            state,
            nu,
            items: Vec::new(),
        }
    }

    pub fn add_cost(&mut self, name: &str, cost: Box<dyn CostModel>, weight: f64) -> Result<()> {
        if self.items.iter().any(|item| item.name == name) {
            return Err(Error::DuplicateName(name.to_string()));
        }
        validate_weight(weight)?;
        check_dim("cost control dimension", self.nu, cost.nu())?;
        check_dim("cost state dimension", self.state.ndx(), cost.state().ndx())?;
        self.items.push(CostItem {
            name: name.to_string(),
            cost,
            weight,
        });
        Ok(())
    }

    pub fn remove_cost(&mut self, name: &str) -> Result<Box<dyn CostModel>> {
        let index = self.position(name)?;
        Ok(self.items.remove(index).cost)
    }

    pub fn weight(&self, name: &str) -> Option<f64> {
        self.items
            .iter()
            .find(|item| item.name == name)
            .map(|item| item.weight)
    }

    /// Retargets an existing term without rebuilding the sum.
    pub fn set_weight(&mut self, name: &str, weight: f64) -> Result<()> {
        validate_weight(weight)?;
        let index = self.position(name)?;
        self.items[index].weight = weight;
        Ok(())
    }

    /// Term names in registration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.items.iter().map(|item| item.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn position(&self, name: &str) -> Result<usize> {
        self.items
            .iter()
            .position(|item| item.name == name)
            .ok_or_else(|| Error::UnknownName(name.to_string()))
    }

    fn check_data(&self, data: &CostData) -> Result<()> {
        check_dim("cost sum data terms", self.items.len(), data.terms.len())?;
        check_dim("cost sum residual", self.nr(), data.r.len())
    }
}

impl CostModel for CostSum {
    fn state(&self) -> &Arc<dyn StateSpace> {
        &self.state
    }

    fn nu(&self) -> usize {
        self.nu
    }

    fn nr(&self) -> usize {
        self.items.iter().map(|item| item.cost.nr()).sum()
    }

    fn create_data(&self) -> CostData {
        let mut data = CostData::new(self.state.ndx(), self.nu, self.nr());
        data.terms = self.items.iter().map(|item| item.cost.create_data()).collect();
        data
    }

    fn calc(
        &self,
        data: &mut CostData,
        shared: &MultibodyData,
        x: &DVector<f64>,
        u: &DVector<f64>,
    ) -> Result<()> {
        check_inputs(self.state.as_ref(), self.nu, x, u)?;
        self.check_data(data)?;
        data.cost = 0.0;
        let mut offset = 0;
        for (item, term) in self.items.iter().zip(data.terms.iter_mut()) {
            item.cost.calc(term, shared, x, u)?;
            data.cost += item.weight * term.cost;
            let nr = term.r.len();
            data.r.rows_mut(offset, nr).copy_from(&term.r);
            offset += nr;
        }
        data.activation.a_value = data.cost;
        Ok(())
    }

    fn calc_diff(
        &self,
        data: &mut CostData,
        shared: &MultibodyData,
        x: &DVector<f64>,
        u: &DVector<f64>,
        recalc: bool,
    ) -> Result<()> {
        if recalc {
            self.calc(data, shared, x, u)?;
        }
        self.check_data(data)?;
        data.lx.fill(0.0);
        data.lu.fill(0.0);
        data.lxx.fill(0.0);
        data.lxu.fill(0.0);
        data.luu.fill(0.0);
        let mut offset = 0;
        for (item, term) in self.items.iter().zip(data.terms.iter_mut()) {
            item.cost.calc_diff(term, shared, x, u, false)?;
            let w = item.weight;
            data.lx.axpy(w, &term.lx, 1.0);
            data.lu.axpy(w, &term.lu, 1.0);
            data.lxx += &term.lxx * w;
            data.lxu += &term.lxu * w;
            data.luu += &term.luu * w;

            let nr = term.r.len();
            data.rx.rows_mut(offset, nr).copy_from(&term.rx);
            data.ru.rows_mut(offset, nr).copy_from(&term.ru);
            data.activation
                .ar
                .rows_mut(offset, nr)
                .copy_from(&(&term.activation.ar * w));
            data.activation
                .arr
                .rows_mut(offset, nr)
                .copy_from(&(&term.activation.arr * w));
            offset += nr;
        }
        Ok(())
    }

    fn calc_activation_diff(&self, data: &mut CostData) -> Result<()> {
        self.check_data(data)?;
        let mut offset = 0;
        for (item, term) in self.items.iter().zip(data.terms.iter_mut()) {
            item.cost.calc_activation_diff(term)?;
            let nr = term.r.len();
            data.activation
                .ar
                .rows_mut(offset, nr)
                .copy_from(&(&term.activation.ar * item.weight));
            data.activation
                .arr
                .rows_mut(offset, nr)
                .copy_from(&(&term.activation.arr * item.weight));
            offset += nr;
        }
        Ok(())
    }
}
