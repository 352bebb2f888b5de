use crate::address::Address;
use crate::models::InvoiceForm;
use crate::parsing::to_base_units;

pub fn required_fields(form: &InvoiceForm) -> Result<(), Vec<String>> {
    let mut errs = Vec::new();

    if form.client_name.trim().is_empty() {
        errs.push("Client name is mandatory".to_string());
    }

    // The client code is the natural key used to match chain records back to drafts.
    if form.client_code.trim().is_empty() {
        errs.push("Client code is mandatory".to_string());
    }

    let currency = form.currency.trim();
    if currency.is_empty() {
        errs.push("Currency is mandatory".to_string());
    } else if !(3..=5).contains(&currency.len())
        || !currency.chars().all(|c| c.is_ascii_alphabetic())
    {
        errs.push("Currency must be 3-5 letters".to_string());
    }

    if errs.is_empty() {
        Ok(())
    } else {
        Err(errs)
    }
}

pub fn amount_and_addresses(form: &InvoiceForm) -> Result<(), Vec<String>> {
    let mut errs = Vec::new();

    match to_base_units(&form.amount) {
        Ok(0) => errs.push("Amount must be greater than zero".to_string()),
        Ok(_) => {}
        Err(e) => errs.push(format!("Amount: {}", e)),
    }

    if let Err(e) = Address::parse(&form.address) {
        errs.push(format!("Address: {}", e));
    }

    if let Some(pay_to) = form.pay_to_address.as_deref() {
        if let Err(e) = Address::parse(pay_to) {
            errs.push(format!("Pay-to address: {}", e));
        }
    }

    if errs.is_empty() {
        Ok(())
    } else {
        Err(errs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn form() -> InvoiceForm {
        InvoiceForm {
            client_name: "Acme".into(),
            client_code: "ACME-7".into(),
            amount: "0.01".into(),
            currency: "RBTC".into(),
            address: "0x00000000000000000000000000000000000000aa".into(),
            ..Default::default()
        }
    }

    #[test]
    fn accepts_complete_form() {
        assert!(required_fields(&form()).is_ok());
        assert!(amount_and_addresses(&form()).is_ok());
    }

    #[test]
    fn reports_every_problem() {
        let mut f = form();
        f.client_name = " ".into();
        f.currency = "R".into();
        assert_eq!(required_fields(&f).unwrap_err().len(), 2);

        f.amount = "0".into();
        f.pay_to_address = Some("0x12".into());
        let errs = amount_and_addresses(&f).unwrap_err();
        assert_eq!(errs.len(), 2);
        assert!(errs[0].contains("greater than zero"));
    }
}
