use crate::model::{ParamMap, ParamMatrix};

/// Cross product of every parameter's alternatives.
///
/// Parameters with no alternatives are left out of the cells. An empty
/// matrix yields a single empty cell so a dependency without parameters is
/// still submitted once.
pub fn expand(matrix: &ParamMatrix) -> Vec<ParamMap> {
    let mut cells = vec![ParamMap::new()];
    for (name, alternatives) in matrix {
        if alternatives.is_empty() {
            continue;
        }
        let mut next = Vec::with_capacity(cells.len() * alternatives.len());
        for cell in &cells {
            for values in alternatives {
                let mut cell = cell.clone();
                cell.insert(name.clone(), values.clone());
                next.push(cell);
            }
        }
        cells = next;
    }
    cells
}
