use crate::models::InvoiceForm;

mod rules;

pub fn validate(form: &InvoiceForm) -> Result<(), Vec<String>> {
    let mut errs = Vec::new();
    if let Err(mut re) = rules::required_fields(form) {
        errs.append(&mut re);
    }
    if let Err(mut re) = rules::amount_and_addresses(form) {
        errs.append(&mut re);
    }
    if errs.is_empty() {
        Ok(())
    } else {
        Err(errs)
    }
}
